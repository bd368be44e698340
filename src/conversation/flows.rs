//! Step handlers for every conversational flow.
//!
//! Each flow kind defines an ordered sequence of steps. A handler receives the
//! raw input for the current step and either accepts it (storing the field and
//! yielding the next prompt, or finishing the flow) or rejects it with a
//! user-facing reason without advancing.

use std::collections::HashMap;

use crate::config::TopupConfig;
use crate::error::ShopResult;
use crate::store::models::{PayChannel, Protocol};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustMode {
    Add,
    Reduce,
    Set,
}

impl AdjustMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdjustMode::Add => "add",
            AdjustMode::Reduce => "reduce",
            AdjustMode::Set => "set",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowKind {
    /// Collect a top-up amount, then hand off to the payment orchestrator.
    /// The channel is pre-picked via buttons when more than one is enabled.
    Topup { channel: Option<PayChannel> },
    /// Collect username (and password where the protocol takes one) for a
    /// purchase whose server/protocol/duration were picked via buttons.
    PurchaseCredentials {
        server_id: String,
        protocol: Protocol,
        duration_days: i64,
    },
    /// Single step: collect the broadcast body.
    Broadcast,
    /// Collect target user id, then amount.
    BalanceAdjust { mode: AdjustMode },
    /// Collect slug id, display name, endpoint, api token.
    RegisterServer,
    /// Collect one 30-day price per protocol, in `Protocol::ALL` order.
    /// 0 marks the protocol as not offered.
    EnterPrices { server_id: String },
}

/// The terminal value of a finished flow. Side effects are the dispatcher's
/// job; the registry only reports what was collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletedFlow {
    Topup {
        amount: i64,
        channel: Option<PayChannel>,
    },
    Purchase {
        server_id: String,
        protocol: Protocol,
        duration_days: i64,
        username: String,
        password: Option<String>,
    },
    Broadcast {
        body: String,
    },
    AdjustBalance {
        mode: AdjustMode,
        target_user: String,
        amount: i64,
    },
    RegisterServer {
        id: String,
        name: String,
        endpoint: String,
        api_token: String,
    },
    SetPrices {
        server_id: String,
        prices: Vec<(Protocol, i64)>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum StepResult {
    Next(String),
    Finish(CompletedFlow),
    Reject(String),
}

pub(crate) fn first_prompt(flow: &FlowKind) -> String {
    match flow {
        FlowKind::Topup { .. } => "Send the amount you want to top up (numbers only).".to_string(),
        FlowKind::PurchaseCredentials { .. } => {
            "Send the username for your new account (lowercase letters and digits only).".to_string()
        }
        FlowKind::Broadcast => "Send the message to broadcast to all users.".to_string(),
        FlowKind::BalanceAdjust { .. } => {
            "Send the user id whose balance you want to change.".to_string()
        }
        FlowKind::RegisterServer => {
            "Step 1/4 — send a unique server id (lowercase letters, digits, dashes).".to_string()
        }
        FlowKind::EnterPrices { .. } => price_prompt(0),
    }
}

pub(crate) fn handle_step(
    flow: &FlowKind,
    step: usize,
    input: &str,
    fields: &mut HashMap<String, String>,
    store: &Store,
    topup: &TopupConfig,
) -> ShopResult<StepResult> {
    let input = input.trim();
    let result = match flow {
        FlowKind::Topup { channel } => topup_step(input, topup, *channel),
        FlowKind::PurchaseCredentials {
            server_id,
            protocol,
            duration_days,
        } => purchase_step(step, input, fields, server_id, *protocol, *duration_days, store)?,
        FlowKind::Broadcast => broadcast_step(input),
        FlowKind::BalanceAdjust { mode } => balance_step(step, input, fields, *mode, store)?,
        FlowKind::RegisterServer => register_server_step(step, input, fields, store)?,
        FlowKind::EnterPrices { server_id } => price_step(step, input, fields, server_id),
    };
    Ok(result)
}

fn topup_step(input: &str, topup: &TopupConfig, channel: Option<PayChannel>) -> StepResult {
    // users paste formatted amounts ("50.000"); keep the digits
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.parse::<i64>() {
        Ok(amount) if amount >= topup.min_amount && amount <= topup.max_amount => {
            StepResult::Finish(CompletedFlow::Topup { amount, channel })
        }
        Ok(_) => StepResult::Reject(format!(
            "Amount must be between {} and {}.",
            topup.min_amount, topup.max_amount
        )),
        Err(_) => StepResult::Reject("Send a plain number, e.g. 50000.".to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
fn purchase_step(
    step: usize,
    input: &str,
    fields: &mut HashMap<String, String>,
    server_id: &str,
    protocol: Protocol,
    duration_days: i64,
    store: &Store,
) -> ShopResult<StepResult> {
    Ok(match step {
        0 => {
            if input.is_empty() || !input.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            {
                return Ok(StepResult::Reject(
                    "Username must be lowercase letters and digits only.".to_string(),
                ));
            }
            if store.lease_username_taken(input)? {
                return Ok(StepResult::Reject(
                    "That username is already taken. Pick another one.".to_string(),
                ));
            }
            fields.insert("username".to_string(), input.to_string());
            if protocol.takes_password() {
                StepResult::Next("Now send the password for the account.".to_string())
            } else {
                StepResult::Finish(CompletedFlow::Purchase {
                    server_id: server_id.to_string(),
                    protocol,
                    duration_days,
                    username: input.to_string(),
                    password: None,
                })
            }
        }
        1 => {
            if input.len() < 4 {
                return Ok(StepResult::Reject(
                    "Password must be at least 4 characters.".to_string(),
                ));
            }
            let username = fields.get("username").cloned().unwrap_or_default();
            StepResult::Finish(CompletedFlow::Purchase {
                server_id: server_id.to_string(),
                protocol,
                duration_days,
                username,
                password: Some(input.to_string()),
            })
        }
        _ => StepResult::Reject("Unexpected input.".to_string()),
    })
}

fn broadcast_step(input: &str) -> StepResult {
    if input.is_empty() {
        return StepResult::Reject("Broadcast message cannot be empty.".to_string());
    }
    StepResult::Finish(CompletedFlow::Broadcast {
        body: input.to_string(),
    })
}

fn balance_step(
    step: usize,
    input: &str,
    fields: &mut HashMap<String, String>,
    mode: AdjustMode,
    store: &Store,
) -> ShopResult<StepResult> {
    Ok(match step {
        0 => match store.get_user(input)? {
            Some(user) => {
                fields.insert("target".to_string(), input.to_string());
                StepResult::Next(format!(
                    "Found @{} (balance {}). Now send the amount.",
                    user.username, user.balance
                ))
            }
            None => StepResult::Reject("No user with that id. Try again.".to_string()),
        },
        1 => match input.parse::<i64>() {
            Ok(amount) if amount >= 0 && (mode == AdjustMode::Set || amount > 0) => {
                let target = fields.get("target").cloned().unwrap_or_default();
                StepResult::Finish(CompletedFlow::AdjustBalance {
                    mode,
                    target_user: target,
                    amount,
                })
            }
            _ => StepResult::Reject("Send a non-negative number.".to_string()),
        },
        _ => StepResult::Reject("Unexpected input.".to_string()),
    })
}

fn register_server_step(
    step: usize,
    input: &str,
    fields: &mut HashMap<String, String>,
    store: &Store,
) -> ShopResult<StepResult> {
    Ok(match step {
        0 => {
            let valid_slug = !input.is_empty()
                && input
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !valid_slug {
                StepResult::Reject(
                    "Server id must be lowercase letters, digits and dashes.".to_string(),
                )
            } else if store.get_server(input)?.is_some() {
                StepResult::Reject("That server id already exists.".to_string())
            } else {
                fields.insert("id".to_string(), input.to_string());
                StepResult::Next("Step 2/4 — send the display name.".to_string())
            }
        }
        1 => {
            if input.is_empty() {
                return Ok(StepResult::Reject("Name cannot be empty.".to_string()));
            }
            fields.insert("name".to_string(), input.to_string());
            StepResult::Next("Step 3/4 — send the panel endpoint URL.".to_string())
        }
        2 => {
            if !input.starts_with("http://") && !input.starts_with("https://") {
                return Ok(StepResult::Reject(
                    "Endpoint must start with http:// or https://.".to_string(),
                ));
            }
            fields.insert("endpoint".to_string(), input.to_string());
            StepResult::Next("Step 4/4 — send the panel API token.".to_string())
        }
        3 => {
            if input.is_empty() {
                return Ok(StepResult::Reject("Token cannot be empty.".to_string()));
            }
            StepResult::Finish(CompletedFlow::RegisterServer {
                id: fields.get("id").cloned().unwrap_or_default(),
                name: fields.get("name").cloned().unwrap_or_default(),
                endpoint: fields.get("endpoint").cloned().unwrap_or_default(),
                api_token: input.to_string(),
            })
        }
        _ => StepResult::Reject("Unexpected input.".to_string()),
    })
}

fn price_prompt(index: usize) -> String {
    let protocol = Protocol::ALL[index];
    format!(
        "Price {}/{} — send the 30-day price for {} (0 if not offered).",
        index + 1,
        Protocol::ALL.len(),
        protocol
    )
}

fn price_step(
    step: usize,
    input: &str,
    fields: &mut HashMap<String, String>,
    server_id: &str,
) -> StepResult {
    if step >= Protocol::ALL.len() {
        return StepResult::Reject("Unexpected input.".to_string());
    }
    let price: i64 = match input.parse() {
        Ok(p) if p >= 0 => p,
        _ => return StepResult::Reject("Send a non-negative number (0 to skip).".to_string()),
    };

    let protocol = Protocol::ALL[step];
    fields.insert(format!("price:{protocol}"), price.to_string());

    if step + 1 < Protocol::ALL.len() {
        StepResult::Next(price_prompt(step + 1))
    } else {
        let prices = Protocol::ALL
            .iter()
            .filter_map(|p| {
                let price: i64 = fields.get(&format!("price:{p}"))?.parse().ok()?;
                (price > 0).then_some((*p, price))
            })
            .collect();
        StepResult::Finish(CompletedFlow::SetPrices {
            server_id: server_id.to_string(),
            prices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Role;
    use tempfile::TempDir;

    fn fixtures() -> (TempDir, Store, TopupConfig) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite")).unwrap();
        store.ensure_user("u1", "alice", Role::Standard).unwrap();
        (dir, store, TopupConfig::default())
    }

    #[test]
    fn topup_strips_formatting() {
        let (_dir, store, topup) = fixtures();
        let mut fields = HashMap::new();
        let flow = FlowKind::Topup {
            channel: Some(PayChannel::Gateway),
        };
        let result = handle_step(&flow, 0, "50.000", &mut fields, &store, &topup).unwrap();
        assert!(matches!(
            result,
            StepResult::Finish(CompletedFlow::Topup {
                amount: 50_000,
                channel: Some(PayChannel::Gateway)
            })
        ));
    }

    #[test]
    fn purchase_skips_password_for_uuid_protocols() {
        let (_dir, store, topup) = fixtures();
        let flow = FlowKind::PurchaseCredentials {
            server_id: "sg-1".into(),
            protocol: Protocol::Vmess,
            duration_days: 30,
        };
        let mut fields = HashMap::new();
        let result = handle_step(&flow, 0, "myuser", &mut fields, &store, &topup).unwrap();
        match result {
            StepResult::Finish(CompletedFlow::Purchase {
                username, password, ..
            }) => {
                assert_eq!(username, "myuser");
                assert!(password.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn purchase_collects_password_for_ssh() {
        let (_dir, store, topup) = fixtures();
        let flow = FlowKind::PurchaseCredentials {
            server_id: "sg-1".into(),
            protocol: Protocol::Ssh,
            duration_days: 60,
        };
        let mut fields = HashMap::new();
        assert!(matches!(
            handle_step(&flow, 0, "myuser", &mut fields, &store, &topup).unwrap(),
            StepResult::Next(_)
        ));
        let result = handle_step(&flow, 1, "s3cret", &mut fields, &store, &topup).unwrap();
        match result {
            StepResult::Finish(CompletedFlow::Purchase {
                password,
                duration_days,
                ..
            }) => {
                assert_eq!(password.as_deref(), Some("s3cret"));
                assert_eq!(duration_days, 60);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn uppercase_username_is_rejected() {
        let (_dir, store, topup) = fixtures();
        let flow = FlowKind::PurchaseCredentials {
            server_id: "sg-1".into(),
            protocol: Protocol::Vmess,
            duration_days: 30,
        };
        let mut fields = HashMap::new();
        assert!(matches!(
            handle_step(&flow, 0, "MyUser", &mut fields, &store, &topup).unwrap(),
            StepResult::Reject(_)
        ));
    }

    #[test]
    fn taken_username_is_rejected_at_input_time() {
        let (_dir, store, topup) = fixtures();
        store
            .insert_lease(
                "u1",
                "sg-1",
                Protocol::Vmess,
                "myuser",
                15_000,
                false,
                chrono::Utc::now() + chrono::Duration::days(30),
            )
            .unwrap();

        let flow = FlowKind::PurchaseCredentials {
            server_id: "sg-1".into(),
            protocol: Protocol::Vmess,
            duration_days: 30,
        };
        let mut fields = HashMap::new();
        assert!(matches!(
            handle_step(&flow, 0, "myuser", &mut fields, &store, &topup).unwrap(),
            StepResult::Reject(_)
        ));
        // a fresh name still goes through
        assert!(matches!(
            handle_step(&flow, 0, "myuser2", &mut fields, &store, &topup).unwrap(),
            StepResult::Finish(_)
        ));
    }

    #[test]
    fn price_flow_collects_offered_protocols_only() {
        let (_dir, store, topup) = fixtures();
        let flow = FlowKind::EnterPrices {
            server_id: "sg-1".into(),
        };
        let mut fields = HashMap::new();
        let inputs = ["15000", "12000", "0", "0", "0", "10000", "0"];
        let mut last = None;
        for (step, input) in inputs.iter().enumerate() {
            last = Some(handle_step(&flow, step, input, &mut fields, &store, &topup).unwrap());
        }
        match last.unwrap() {
            StepResult::Finish(CompletedFlow::SetPrices { prices, .. }) => {
                assert_eq!(
                    prices,
                    vec![
                        (Protocol::Ssh, 15_000),
                        (Protocol::Vmess, 12_000),
                        (Protocol::Socks5, 10_000)
                    ]
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
