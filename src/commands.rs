//! Closed set of button commands. Callback payloads are decoded once at the
//! boundary into these variants and dispatched by pattern matching; `encode`
//! produces the payload a button carries.

use crate::store::models::{PayChannel, Protocol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Menu,
    Balance,
    MyAccounts,
    CancelFlow,

    Topup,
    TopupVia(PayChannel),
    CancelInvoice { invoice_id: String },

    Buy,
    BuyServer { server_id: String },
    BuyProtocol { server_id: String, protocol: Protocol },
    BuyDuration { server_id: String, protocol: Protocol, days: i64 },
    Renew { lease_id: i64 },

    Trial,
    TrialServer { server_id: String },
    TrialProtocol { server_id: String, protocol: Protocol },

    Admin,
    AdminAddServer,
    AdminServers,
    AdminDropServer { server_id: String },
    AdminPrices { server_id: String },
    AdminBalanceAdd,
    AdminBalanceReduce,
    AdminBalanceSet,
    AdminBroadcast,
    AdminRecentTopups,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Command::Menu => "menu".into(),
            Command::Balance => "balance".into(),
            Command::MyAccounts => "accounts".into(),
            Command::CancelFlow => "cancel".into(),
            Command::Topup => "topup".into(),
            Command::TopupVia(channel) => format!("topup:{}", channel.as_str()),
            Command::CancelInvoice { invoice_id } => format!("inv_cancel:{invoice_id}"),
            Command::Buy => "buy".into(),
            Command::BuyServer { server_id } => format!("buy:{server_id}"),
            Command::BuyProtocol { server_id, protocol } => {
                format!("buy:{server_id}:{}", protocol.as_str())
            }
            Command::BuyDuration {
                server_id,
                protocol,
                days,
            } => format!("buy:{server_id}:{}:{days}", protocol.as_str()),
            Command::Renew { lease_id } => format!("renew:{lease_id}"),
            Command::Trial => "trial".into(),
            Command::TrialServer { server_id } => format!("trial:{server_id}"),
            Command::TrialProtocol { server_id, protocol } => {
                format!("trial:{server_id}:{}", protocol.as_str())
            }
            Command::Admin => "admin".into(),
            Command::AdminAddServer => "adm_addsrv".into(),
            Command::AdminServers => "adm_servers".into(),
            Command::AdminDropServer { server_id } => format!("adm_dropsrv:{server_id}"),
            Command::AdminPrices { server_id } => format!("adm_prices:{server_id}"),
            Command::AdminBalanceAdd => "adm_bal:add".into(),
            Command::AdminBalanceReduce => "adm_bal:reduce".into(),
            Command::AdminBalanceSet => "adm_bal:set".into(),
            Command::AdminBroadcast => "adm_cast".into(),
            Command::AdminRecentTopups => "adm_topups".into(),
        }
    }

    pub fn parse(data: &str) -> Option<Command> {
        let mut parts = data.split(':');
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        let command = match (head, rest.as_slice()) {
            ("menu", []) => Command::Menu,
            ("balance", []) => Command::Balance,
            ("accounts", []) => Command::MyAccounts,
            ("cancel", []) => Command::CancelFlow,

            ("topup", []) => Command::Topup,
            ("topup", [channel]) => Command::TopupVia(channel.parse().ok()?),
            ("inv_cancel", [invoice_id]) => Command::CancelInvoice {
                invoice_id: invoice_id.to_string(),
            },

            ("buy", []) => Command::Buy,
            ("buy", [server_id]) => Command::BuyServer {
                server_id: server_id.to_string(),
            },
            ("buy", [server_id, protocol]) => Command::BuyProtocol {
                server_id: server_id.to_string(),
                protocol: protocol.parse().ok()?,
            },
            ("buy", [server_id, protocol, days]) => Command::BuyDuration {
                server_id: server_id.to_string(),
                protocol: protocol.parse().ok()?,
                days: days.parse().ok()?,
            },
            ("renew", [lease_id]) => Command::Renew {
                lease_id: lease_id.parse().ok()?,
            },

            ("trial", []) => Command::Trial,
            ("trial", [server_id]) => Command::TrialServer {
                server_id: server_id.to_string(),
            },
            ("trial", [server_id, protocol]) => Command::TrialProtocol {
                server_id: server_id.to_string(),
                protocol: protocol.parse().ok()?,
            },

            ("admin", []) => Command::Admin,
            ("adm_addsrv", []) => Command::AdminAddServer,
            ("adm_servers", []) => Command::AdminServers,
            ("adm_dropsrv", [server_id]) => Command::AdminDropServer {
                server_id: server_id.to_string(),
            },
            ("adm_prices", [server_id]) => Command::AdminPrices {
                server_id: server_id.to_string(),
            },
            ("adm_bal", ["add"]) => Command::AdminBalanceAdd,
            ("adm_bal", ["reduce"]) => Command::AdminBalanceReduce,
            ("adm_bal", ["set"]) => Command::AdminBalanceSet,
            ("adm_cast", []) => Command::AdminBroadcast,
            ("adm_topups", []) => Command::AdminRecentTopups,

            _ => return None,
        };
        Some(command)
    }

    /// Commands behind the admin gate.
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::Admin
                | Command::AdminAddServer
                | Command::AdminServers
                | Command::AdminDropServer { .. }
                | Command::AdminPrices { .. }
                | Command::AdminBalanceAdd
                | Command::AdminBalanceReduce
                | Command::AdminBalanceSet
                | Command::AdminBroadcast
                | Command::AdminRecentTopups
        )
    }
}
