//! Chat event dispatcher: classifies inbound events, routes text into the
//! pending conversation when one exists, decodes button payloads into
//! commands, and runs the terminal side effects of completed flows.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::Receiver;
use tracing::{info, warn};

use crate::commands::Command;
use crate::config::BotConfig;
use crate::conversation::{Advance, AdjustMode, CompletedFlow, ConversationRegistry, FlowKind, MessageRef};
use crate::error::ShopError;
use crate::ledger::Ledger;
use crate::payment::{InvoiceCreation, PaymentOrchestrator};
use crate::provisioning::ProvisioningCoordinator;
use crate::store::models::{PayChannel, Role};
use crate::store::Store;
use crate::transport::{Button, ChatEvent, ChatTransport, Keyboard};

const BROADCAST_SPACING: Duration = Duration::from_millis(100);
const PURCHASE_DURATIONS: [i64; 3] = [30, 60, 90];

pub struct Bot {
    store: Store,
    ledger: Ledger,
    conversations: ConversationRegistry,
    payments: Arc<PaymentOrchestrator>,
    provisioning: ProvisioningCoordinator,
    transport: Arc<dyn ChatTransport>,
    config: BotConfig,
    trial_enabled: bool,
}

impl Bot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        ledger: Ledger,
        conversations: ConversationRegistry,
        payments: Arc<PaymentOrchestrator>,
        provisioning: ProvisioningCoordinator,
        transport: Arc<dyn ChatTransport>,
        config: BotConfig,
        trial_enabled: bool,
    ) -> Self {
        Self {
            store,
            ledger,
            conversations,
            payments,
            provisioning,
            transport,
            config,
            trial_enabled,
        }
    }

    /// Consume inbound events until the channel closes. Each event is handled
    /// on its own task so a slow remote call never blocks the queue.
    pub async fn run(self: Arc<Self>, mut rx: Receiver<ChatEvent>) {
        info!("dispatcher running");
        while let Some(event) = rx.recv().await {
            let bot = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = bot.handle_event(event).await {
                    warn!("event handling failed: {e:#}");
                }
            });
        }
    }

    async fn handle_event(&self, event: ChatEvent) -> Result<()> {
        self.register_contact(&event)?;
        match event {
            ChatEvent::Text {
                user_id,
                chat_id,
                text,
                ..
            } => self.handle_text(&user_id, chat_id, &text).await,
            ChatEvent::Callback {
                user_id,
                chat_id,
                message_id,
                callback_id,
                data,
                ..
            } => {
                self.handle_callback(&user_id, chat_id, message_id, &callback_id, &data)
                    .await
            }
        }
    }

    /// First contact creates the user; the configured owner id lands as admin.
    fn register_contact(&self, event: &ChatEvent) -> Result<()> {
        let (user_id, username) = match event {
            ChatEvent::Text {
                user_id, username, ..
            }
            | ChatEvent::Callback {
                user_id, username, ..
            } => (user_id, username),
        };
        let role = if *user_id == self.config.admin_id.to_string() {
            Role::Admin
        } else {
            Role::Standard
        };
        self.store.ensure_user(user_id, username, role)?;
        Ok(())
    }

    async fn handle_text(&self, user_id: &str, chat_id: i64, text: &str) -> Result<()> {
        match text.trim() {
            "/start" => {
                self.conversations.cancel(user_id).await;
                self.send_main_menu(user_id, chat_id).await
            }
            "/admin" => {
                if !self.is_admin(user_id)? {
                    self.transport
                        .send_message(chat_id, "This command is admin-only.", None)
                        .await?;
                    return Ok(());
                }
                self.send_admin_menu(chat_id).await
            }
            "/cancel" => {
                let had_flow = self.conversations.cancel(user_id).await;
                let text = if had_flow {
                    "Cancelled."
                } else {
                    "Nothing to cancel."
                };
                self.transport.send_message(chat_id, text, None).await?;
                Ok(())
            }
            input => match self.conversations.advance(user_id, input).await {
                Ok(Some(advance)) => self.apply_advance(user_id, chat_id, advance).await,
                Ok(None) => {
                    self.transport
                        .send_message(chat_id, "Use /start to open the menu.", None)
                        .await?;
                    Ok(())
                }
                Err(e) => {
                    self.transport
                        .send_message(chat_id, &user_message(&e), None)
                        .await?;
                    Ok(())
                }
            },
        }
    }

    async fn apply_advance(&self, user_id: &str, chat_id: i64, advance: Advance) -> Result<()> {
        match advance {
            Advance::Next { prompt } => {
                self.transport
                    .send_message(chat_id, &prompt, Some(cancel_keyboard()))
                    .await?;
            }
            Advance::Rejected { reason } => {
                self.transport.send_message(chat_id, &reason, None).await?;
            }
            Advance::Complete(completed) => {
                self.execute_flow(user_id, chat_id, completed).await?;
            }
        }
        Ok(())
    }

    async fn handle_callback(
        &self,
        user_id: &str,
        chat_id: i64,
        message_id: i64,
        callback_id: &str,
        data: &str,
    ) -> Result<()> {
        let Some(command) = Command::parse(data) else {
            self.transport
                .answer_callback(callback_id, Some("This button has expired."))
                .await?;
            return Ok(());
        };
        if command.requires_admin() && !self.is_admin(user_id)? {
            self.transport
                .answer_callback(callback_id, Some("Admins only."))
                .await?;
            return Ok(());
        }
        self.transport.answer_callback(callback_id, None).await?;

        match command {
            Command::Menu => {
                self.conversations.cancel(user_id).await;
                self.edit_to_main_menu(user_id, chat_id, message_id).await
            }
            Command::Balance => self.show_balance(user_id, chat_id, message_id).await,
            Command::MyAccounts => self.show_accounts(user_id, chat_id, message_id).await,
            Command::CancelFlow => {
                self.conversations.cancel(user_id).await;
                self.edit_to_main_menu(user_id, chat_id, message_id).await
            }

            Command::Topup => self.start_topup(user_id, chat_id, message_id).await,
            Command::TopupVia(channel) => {
                self.begin_flow(
                    user_id,
                    chat_id,
                    message_id,
                    FlowKind::Topup {
                        channel: Some(channel),
                    },
                )
                .await
            }
            Command::CancelInvoice { invoice_id } => {
                // stop the poller; cancelling never marks anything paid
                self.payments.expire(&invoice_id)?;
                let _ = self.transport.delete_message(chat_id, message_id).await;
                self.transport
                    .send_message(chat_id, "Invoice cancelled.", None)
                    .await?;
                Ok(())
            }

            Command::Buy => self.show_servers(chat_id, message_id, false).await,
            Command::BuyServer { server_id } => {
                self.show_protocols(chat_id, message_id, &server_id, false)
                    .await
            }
            Command::BuyProtocol {
                server_id,
                protocol,
            } => {
                let rows: Keyboard = PURCHASE_DURATIONS
                    .iter()
                    .map(|days| {
                        vec![Button::new(
                            format!("{days} days"),
                            Command::BuyDuration {
                                server_id: server_id.clone(),
                                protocol,
                                days: *days,
                            }
                            .encode(),
                        )]
                    })
                    .chain(std::iter::once(back_row()))
                    .collect();
                self.transport
                    .edit_message(chat_id, message_id, "Pick a duration:", Some(rows))
                    .await?;
                Ok(())
            }
            Command::BuyDuration {
                server_id,
                protocol,
                days,
            } => {
                self.begin_flow(
                    user_id,
                    chat_id,
                    message_id,
                    FlowKind::PurchaseCredentials {
                        server_id,
                        protocol,
                        duration_days: days,
                    },
                )
                .await
            }
            Command::Renew { lease_id } => self.renew(user_id, chat_id, lease_id).await,

            Command::Trial => {
                if !self.trial_enabled {
                    self.transport
                        .send_message(chat_id, "Trials are currently disabled.", None)
                        .await?;
                    return Ok(());
                }
                self.show_servers(chat_id, message_id, true).await
            }
            Command::TrialServer { server_id } => {
                self.show_protocols(chat_id, message_id, &server_id, true)
                    .await
            }
            Command::TrialProtocol {
                server_id,
                protocol,
            } => self.claim_trial(user_id, chat_id, &server_id, protocol).await,

            Command::Admin => {
                self.transport
                    .edit_message(chat_id, message_id, "Admin panel:", Some(admin_keyboard()))
                    .await?;
                Ok(())
            }
            Command::AdminAddServer => {
                self.begin_flow(user_id, chat_id, message_id, FlowKind::RegisterServer)
                    .await
            }
            Command::AdminServers => self.show_admin_servers(chat_id, message_id).await,
            Command::AdminDropServer { server_id } => {
                match self.store.delete_server(&server_id) {
                    Ok(()) => {
                        self.transport
                            .send_message(chat_id, &format!("Server {server_id} removed."), None)
                            .await?;
                    }
                    Err(e) => {
                        self.transport
                            .send_message(chat_id, &user_message(&e), None)
                            .await?;
                    }
                }
                Ok(())
            }
            Command::AdminPrices { server_id } => {
                self.begin_flow(user_id, chat_id, message_id, FlowKind::EnterPrices { server_id })
                    .await
            }
            Command::AdminBalanceAdd => {
                self.begin_flow(
                    user_id,
                    chat_id,
                    message_id,
                    FlowKind::BalanceAdjust {
                        mode: AdjustMode::Add,
                    },
                )
                .await
            }
            Command::AdminBalanceReduce => {
                self.begin_flow(
                    user_id,
                    chat_id,
                    message_id,
                    FlowKind::BalanceAdjust {
                        mode: AdjustMode::Reduce,
                    },
                )
                .await
            }
            Command::AdminBalanceSet => {
                self.begin_flow(
                    user_id,
                    chat_id,
                    message_id,
                    FlowKind::BalanceAdjust {
                        mode: AdjustMode::Set,
                    },
                )
                .await
            }
            Command::AdminBroadcast => {
                self.begin_flow(user_id, chat_id, message_id, FlowKind::Broadcast)
                    .await
            }
            Command::AdminRecentTopups => self.show_recent_topups(chat_id, message_id).await,
        }
    }

    // ---- flow plumbing ----

    /// Start a flow anchored to the message the triggering button lives on;
    /// the prompt replaces the menu in place.
    async fn begin_flow(
        &self,
        user_id: &str,
        chat_id: i64,
        message_id: i64,
        flow: FlowKind,
    ) -> Result<()> {
        let prompt = self
            .conversations
            .begin(user_id, flow, MessageRef { chat_id, message_id })
            .await;
        self.transport
            .edit_message(chat_id, message_id, &prompt, Some(cancel_keyboard()))
            .await?;
        Ok(())
    }

    async fn execute_flow(
        &self,
        user_id: &str,
        chat_id: i64,
        completed: CompletedFlow,
    ) -> Result<()> {
        match completed {
            CompletedFlow::Topup { amount, channel } => {
                self.create_invoice(user_id, chat_id, amount, channel).await
            }
            CompletedFlow::Purchase {
                server_id,
                protocol,
                duration_days,
                username,
                password,
            } => {
                match self
                    .provisioning
                    .purchase(
                        user_id,
                        &server_id,
                        protocol,
                        duration_days,
                        &username,
                        password.as_deref(),
                    )
                    .await
                {
                    Ok((lease, metadata)) => {
                        self.transport
                            .send_message(
                                chat_id,
                                &format!(
                                    "Account created. Expires {}.\n\n{}",
                                    lease.expires_at.format("%Y-%m-%d %H:%M UTC"),
                                    metadata.summary()
                                ),
                                Some(menu_keyboard_row()),
                            )
                            .await?;
                        self.notify_group(&format!(
                            "Purchase: {} on {} for {} ({} days).",
                            protocol.as_str(),
                            server_id,
                            fmt_money(lease.price),
                            duration_days
                        ))
                        .await;
                    }
                    Err(e) => {
                        self.transport
                            .send_message(chat_id, &user_message(&e), None)
                            .await?;
                    }
                }
                Ok(())
            }
            CompletedFlow::Broadcast { body } => {
                self.spawn_broadcast(chat_id, body);
                self.transport
                    .send_message(chat_id, "Broadcast started.", None)
                    .await?;
                Ok(())
            }
            CompletedFlow::AdjustBalance {
                mode,
                target_user,
                amount,
            } => {
                let result = match mode {
                    AdjustMode::Add => self.ledger.credit(
                        &target_user,
                        amount,
                        crate::store::models::LedgerReason::AdminAdd,
                        None,
                    ),
                    AdjustMode::Reduce => self.ledger.debit(
                        &target_user,
                        amount,
                        crate::store::models::LedgerReason::AdminReduce,
                        None,
                    ),
                    AdjustMode::Set => self.ledger.set_balance(&target_user, amount),
                };
                match result {
                    Ok(change) => {
                        self.transport
                            .send_message(
                                chat_id,
                                &format!(
                                    "Balance for {target_user}: {} -> {}.",
                                    fmt_money(change.previous),
                                    fmt_money(change.new)
                                ),
                                None,
                            )
                            .await?;
                        if let Ok(target_chat) = target_user.parse::<i64>() {
                            let _ = self
                                .transport
                                .send_message(
                                    target_chat,
                                    &format!(
                                        "An admin updated your balance: {} -> {}.",
                                        fmt_money(change.previous),
                                        fmt_money(change.new)
                                    ),
                                    None,
                                )
                                .await;
                        }
                    }
                    Err(e) => {
                        self.transport
                            .send_message(chat_id, &user_message(&e), None)
                            .await?;
                    }
                }
                Ok(())
            }
            CompletedFlow::RegisterServer {
                id,
                name,
                endpoint,
                api_token,
            } => {
                let record = crate::store::models::ServerRecord {
                    id: id.clone(),
                    name,
                    endpoint,
                    api_token,
                    created_at: chrono::Utc::now(),
                };
                if let Err(e) = self.store.insert_server(&record) {
                    self.transport
                        .send_message(chat_id, &user_message(&e), None)
                        .await?;
                    return Ok(());
                }
                // chain straight into price entry for the new server
                let message_id = self
                    .transport
                    .send_message(chat_id, &format!("Server {id} registered."), None)
                    .await?;
                let prompt = self
                    .conversations
                    .begin(
                        user_id,
                        FlowKind::EnterPrices { server_id: id },
                        MessageRef { chat_id, message_id },
                    )
                    .await;
                self.transport
                    .send_message(chat_id, &prompt, Some(cancel_keyboard()))
                    .await?;
                Ok(())
            }
            CompletedFlow::SetPrices { server_id, prices } => {
                for (protocol, price) in &prices {
                    self.store
                        .set_price(&server_id, *protocol, Role::Standard, *price)?;
                }
                self.transport
                    .send_message(
                        chat_id,
                        &format!(
                            "Saved {} price(s) for {server_id}.",
                            prices.len()
                        ),
                        Some(menu_keyboard_row()),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn create_invoice(
        &self,
        user_id: &str,
        chat_id: i64,
        amount: i64,
        channel: Option<PayChannel>,
    ) -> Result<()> {
        match self.payments.create_invoice(user_id, amount, channel).await {
            Ok(InvoiceCreation::Created(handle)) => {
                let caption = format!(
                    "Invoice for {}. Scan the QR to pay; I'll confirm automatically.",
                    fmt_money(handle.invoice.amount)
                );
                let cancel = vec![vec![Button::new(
                    "Cancel invoice",
                    Command::CancelInvoice {
                        invoice_id: handle.invoice.id.clone(),
                    }
                    .encode(),
                )]];
                let qr_message_id = self
                    .transport
                    .send_photo(chat_id, handle.qr_png.clone(), &caption, Some(cancel))
                    .await?;
                self.payments.spawn_poll(
                    handle.invoice,
                    chat_id,
                    qr_message_id,
                    Arc::clone(&self.transport),
                );
            }
            Ok(InvoiceCreation::ChooseBackend(channels)) => {
                let rows: Keyboard = channels
                    .into_iter()
                    .map(|c| vec![Button::new(channel_label(c), Command::TopupVia(c).encode())])
                    .collect();
                self.transport
                    .send_message(chat_id, "Pick a payment method:", Some(rows))
                    .await?;
            }
            Err(e) => {
                self.transport
                    .send_message(chat_id, &user_message(&e), None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn renew(&self, user_id: &str, chat_id: i64, lease_id: i64) -> Result<()> {
        match self.provisioning.renew(user_id, lease_id).await {
            Ok(lease) => {
                self.transport
                    .send_message(
                        chat_id,
                        &format!(
                            "Renewed '{}'. New expiry: {}.",
                            lease.username,
                            lease.expires_at.format("%Y-%m-%d %H:%M UTC")
                        ),
                        Some(menu_keyboard_row()),
                    )
                    .await?;
            }
            Err(e) => {
                self.transport
                    .send_message(chat_id, &user_message(&e), None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn claim_trial(
        &self,
        user_id: &str,
        chat_id: i64,
        server_id: &str,
        protocol: crate::store::models::Protocol,
    ) -> Result<()> {
        match self.provisioning.claim_trial(user_id, server_id, protocol).await {
            Ok((lease, metadata)) => {
                self.transport
                    .send_message(
                        chat_id,
                        &format!(
                            "Trial account ready, valid until {}.\n\n{}",
                            lease.expires_at.format("%H:%M UTC"),
                            metadata.summary()
                        ),
                        Some(menu_keyboard_row()),
                    )
                    .await?;
            }
            Err(e) => {
                self.transport
                    .send_message(chat_id, &user_message(&e), None)
                    .await?;
            }
        }
        Ok(())
    }

    // ---- menus & listings ----

    fn is_admin(&self, user_id: &str) -> Result<bool> {
        if user_id == self.config.admin_id.to_string() {
            return Ok(true);
        }
        Ok(self
            .store
            .get_user(user_id)?
            .map(|u| u.role == Role::Admin)
            .unwrap_or(false))
    }

    fn main_menu(&self, is_admin: bool) -> (String, Keyboard) {
        let mut rows = vec![
            vec![
                Button::new("Top up", Command::Topup.encode()),
                Button::new("Balance", Command::Balance.encode()),
            ],
            vec![
                Button::new("Buy account", Command::Buy.encode()),
                Button::new("My accounts", Command::MyAccounts.encode()),
            ],
        ];
        if self.trial_enabled {
            rows.push(vec![Button::new("Free trial", Command::Trial.encode())]);
        }
        if is_admin {
            rows.push(vec![Button::new("Admin panel", Command::Admin.encode())]);
        }
        (
            format!("Welcome to {}. What would you like to do?", self.config.store_name),
            rows,
        )
    }

    async fn send_main_menu(&self, user_id: &str, chat_id: i64) -> Result<()> {
        let (text, keyboard) = self.main_menu(self.is_admin(user_id)?);
        self.transport
            .send_message(chat_id, &text, Some(keyboard))
            .await?;
        Ok(())
    }

    async fn edit_to_main_menu(&self, user_id: &str, chat_id: i64, message_id: i64) -> Result<()> {
        let (text, keyboard) = self.main_menu(self.is_admin(user_id)?);
        self.transport
            .edit_message(chat_id, message_id, &text, Some(keyboard))
            .await?;
        Ok(())
    }

    async fn send_admin_menu(&self, chat_id: i64) -> Result<()> {
        self.transport
            .send_message(chat_id, "Admin panel:", Some(admin_keyboard()))
            .await?;
        Ok(())
    }

    async fn show_balance(&self, user_id: &str, chat_id: i64, message_id: i64) -> Result<()> {
        let balance = self.ledger.balance(user_id)?;
        let entries = self.ledger.history(user_id)?;
        let mut text = format!("Balance: {}\n", fmt_money(balance));
        if !entries.is_empty() {
            text.push_str("\nRecent activity:\n");
            for entry in entries.iter().rev().take(5) {
                text.push_str(&format!(
                    "{} {} ({})\n",
                    entry.created_at.format("%m-%d"),
                    fmt_money(entry.amount),
                    entry.reason.as_str()
                ));
            }
        }
        self.transport
            .edit_message(chat_id, message_id, &text, Some(menu_keyboard_row()))
            .await?;
        Ok(())
    }

    async fn show_accounts(&self, user_id: &str, chat_id: i64, message_id: i64) -> Result<()> {
        let leases = self.store.leases_for_user(user_id)?;
        if leases.is_empty() {
            self.transport
                .edit_message(
                    chat_id,
                    message_id,
                    "You have no active accounts.",
                    Some(menu_keyboard_row()),
                )
                .await?;
            return Ok(());
        }
        let mut text = String::from("Your accounts:\n\n");
        let mut rows: Keyboard = Vec::new();
        for lease in &leases {
            text.push_str(&format!(
                "{} '{}' on {} — expires {}\n",
                lease.protocol.as_str(),
                lease.username,
                lease.server_id,
                lease.expires_at.format("%Y-%m-%d")
            ));
            rows.push(vec![Button::new(
                format!("Renew {} (+30d)", lease.username),
                Command::Renew { lease_id: lease.id }.encode(),
            )]);
        }
        rows.push(back_row());
        self.transport
            .edit_message(chat_id, message_id, &text, Some(rows))
            .await?;
        Ok(())
    }

    async fn start_topup(&self, user_id: &str, chat_id: i64, message_id: i64) -> Result<()> {
        let channels = self.payments.enabled_channels();
        match channels.len() {
            0 => {
                self.transport
                    .edit_message(
                        chat_id,
                        message_id,
                        &user_message(&ShopError::AllBackendsDisabled),
                        Some(menu_keyboard_row()),
                    )
                    .await?;
                Ok(())
            }
            1 => {
                self.begin_flow(user_id, chat_id, message_id, FlowKind::Topup { channel: None })
                    .await
            }
            _ => {
                let rows: Keyboard = channels
                    .into_iter()
                    .map(|c| vec![Button::new(channel_label(c), Command::TopupVia(c).encode())])
                    .chain(std::iter::once(back_row()))
                    .collect();
                self.transport
                    .edit_message(chat_id, message_id, "Pick a payment method:", Some(rows))
                    .await?;
                Ok(())
            }
        }
    }

    async fn show_servers(&self, chat_id: i64, message_id: i64, trial: bool) -> Result<()> {
        let servers = self.store.list_servers()?;
        if servers.is_empty() {
            self.transport
                .edit_message(
                    chat_id,
                    message_id,
                    "No servers available yet.",
                    Some(menu_keyboard_row()),
                )
                .await?;
            return Ok(());
        }
        let rows: Keyboard = servers
            .into_iter()
            .map(|s| {
                let command = if trial {
                    Command::TrialServer {
                        server_id: s.id.clone(),
                    }
                } else {
                    Command::BuyServer {
                        server_id: s.id.clone(),
                    }
                };
                vec![Button::new(s.name, command.encode())]
            })
            .chain(std::iter::once(back_row()))
            .collect();
        self.transport
            .edit_message(chat_id, message_id, "Pick a server:", Some(rows))
            .await?;
        Ok(())
    }

    async fn show_protocols(
        &self,
        chat_id: i64,
        message_id: i64,
        server_id: &str,
        trial: bool,
    ) -> Result<()> {
        let protocols = self.store.protocols_for_server(server_id)?;
        if protocols.is_empty() {
            self.transport
                .edit_message(
                    chat_id,
                    message_id,
                    "Nothing is offered on that server yet.",
                    Some(menu_keyboard_row()),
                )
                .await?;
            return Ok(());
        }
        let rows: Keyboard = protocols
            .into_iter()
            .map(|(protocol, price)| {
                let command = if trial {
                    Command::TrialProtocol {
                        server_id: server_id.to_string(),
                        protocol,
                    }
                } else {
                    Command::BuyProtocol {
                        server_id: server_id.to_string(),
                        protocol,
                    }
                };
                let label = if trial {
                    protocol.as_str().to_string()
                } else {
                    format!("{} — {}/30d", protocol.as_str(), fmt_money(price))
                };
                vec![Button::new(label, command.encode())]
            })
            .chain(std::iter::once(back_row()))
            .collect();
        self.transport
            .edit_message(chat_id, message_id, "Pick a protocol:", Some(rows))
            .await?;
        Ok(())
    }

    async fn show_admin_servers(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let servers = self.store.list_servers()?;
        if servers.is_empty() {
            self.transport
                .edit_message(
                    chat_id,
                    message_id,
                    "No servers registered.",
                    Some(vec![vec![Button::new(
                        "Add server",
                        Command::AdminAddServer.encode(),
                    )]]),
                )
                .await?;
            return Ok(());
        }
        let mut rows: Keyboard = Vec::new();
        for server in servers {
            rows.push(vec![
                Button::new(
                    format!("{} prices", server.id),
                    Command::AdminPrices {
                        server_id: server.id.clone(),
                    }
                    .encode(),
                ),
                Button::new(
                    format!("drop {}", server.id),
                    Command::AdminDropServer {
                        server_id: server.id,
                    }
                    .encode(),
                ),
            ]);
        }
        rows.push(back_row());
        self.transport
            .edit_message(chat_id, message_id, "Registered servers:", Some(rows))
            .await?;
        Ok(())
    }

    async fn show_recent_topups(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let invoices = self.payments.recent_settled(10)?;
        let text = if invoices.is_empty() {
            "No settled top-ups yet.".to_string()
        } else {
            let mut text = String::from("Recent top-ups:\n\n");
            for invoice in invoices {
                text.push_str(&format!(
                    "{} {} by {} via {}\n",
                    invoice.created_at.format("%m-%d %H:%M"),
                    fmt_money(invoice.amount),
                    invoice.user_id,
                    invoice.channel.as_str()
                ));
            }
            text
        };
        self.transport
            .edit_message(chat_id, message_id, &text, Some(menu_keyboard_row()))
            .await?;
        Ok(())
    }

    // ---- broadcast & notifications ----

    /// Fan out a message to every known user on a background task. Individual
    /// failures are counted, never fatal; delivery is spaced to stay under
    /// transport rate limits.
    fn spawn_broadcast(&self, report_chat: i64, body: String) {
        let transport = Arc::clone(&self.transport);
        let store = self.store.clone();
        tokio::spawn(async move {
            let ids = match store.all_user_ids() {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("broadcast aborted, user list unavailable: {e}");
                    return;
                }
            };
            let total = ids.len();
            let mut sent = 0usize;
            let mut failed = 0usize;
            for id in ids {
                let Ok(chat_id) = id.parse::<i64>() else {
                    failed += 1;
                    continue;
                };
                match transport.send_message(chat_id, &body, None).await {
                    Ok(_) => sent += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(user_id = %id, "broadcast delivery failed: {e}");
                    }
                }
                tokio::time::sleep(BROADCAST_SPACING).await;
            }
            info!(total, sent, failed, "broadcast finished");
            let _ = transport
                .send_message(
                    report_chat,
                    &format!("Broadcast finished: {sent}/{total} delivered, {failed} failed."),
                    None,
                )
                .await;
        });
    }

    async fn notify_group(&self, text: &str) {
        if let Some(group_id) = self.config.notify_chat_id {
            if let Err(e) = self.transport.send_message(group_id, text, None).await {
                warn!("group notification failed: {e}");
            }
        }
    }
}

fn cancel_keyboard() -> Keyboard {
    vec![vec![Button::new("Cancel", Command::CancelFlow.encode())]]
}

fn back_row() -> Vec<Button> {
    vec![Button::new("« Back", Command::Menu.encode())]
}

fn menu_keyboard_row() -> Keyboard {
    vec![back_row()]
}

fn admin_keyboard() -> Keyboard {
    vec![
        vec![
            Button::new("Add server", Command::AdminAddServer.encode()),
            Button::new("Servers", Command::AdminServers.encode()),
        ],
        vec![
            Button::new("Bal +", Command::AdminBalanceAdd.encode()),
            Button::new("Bal -", Command::AdminBalanceReduce.encode()),
            Button::new("Bal =", Command::AdminBalanceSet.encode()),
        ],
        vec![
            Button::new("Broadcast", Command::AdminBroadcast.encode()),
            Button::new("Top-ups", Command::AdminRecentTopups.encode()),
        ],
        back_row(),
    ]
}

fn channel_label(channel: PayChannel) -> &'static str {
    match channel {
        PayChannel::Gateway => "Payment gateway",
        PayChannel::Donation => "QR donation",
    }
}

/// User-facing rendering of domain errors. Internal failures stay vague.
fn user_message(err: &ShopError) -> String {
    match err {
        ShopError::Validation(reason) => reason.clone(),
        ShopError::NotFound(what) => format!("Not found: {what}."),
        ShopError::InsufficientBalance {
            required,
            available,
        } => format!(
            "Insufficient balance: this costs {} but you have {}. Top up first.",
            fmt_money(*required),
            fmt_money(*available)
        ),
        ShopError::RemoteProvisioning(reason) => {
            format!("The server rejected the request: {reason}. Nothing was charged.")
        }
        ShopError::RemoteTimeout => {
            "The server did not respond in time. Nothing was charged; try again later.".to_string()
        }
        ShopError::AmountOutOfRange { min, max } => format!(
            "Amount must be between {} and {}.",
            fmt_money(*min),
            fmt_money(*max)
        ),
        ShopError::BackendDisabled => "That payment method is not available.".to_string(),
        ShopError::AllBackendsDisabled => {
            "Top-ups are temporarily unavailable.".to_string()
        }
        _ => "Something went wrong. Please try again later.".to_string(),
    }
}

/// Group thousands with dots, the way the storefront's currency is written.
fn fmt_money(amount: i64) -> String {
    let negative = amount < 0;
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    if negative {
        format!("-{out}")
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn money_formatting_groups_thousands() {
        assert_eq!(fmt_money(0), "0");
        assert_eq!(fmt_money(500), "500");
        assert_eq!(fmt_money(50_000), "50.000");
        assert_eq!(fmt_money(1_250_000), "1.250.000");
        assert_eq!(fmt_money(-15_000), "-15.000");
    }

    #[test]
    fn insufficient_balance_message_names_amounts() {
        let message = user_message(&ShopError::InsufficientBalance {
            required: 15_000,
            available: 10_000,
        });
        assert!(message.contains("15.000"));
        assert!(message.contains("10.000"));
    }
}
