pub mod backends;
pub mod webhook;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::TopupConfig;
use crate::error::{ShopError, ShopResult};
use crate::ledger::Ledger;
use crate::store::models::{Invoice, InvoiceStatus, PayChannel};
use crate::store::Store;
use crate::transport::ChatTransport;
use backends::{CreatedInvoice, PaymentBackend};

/// A freshly created invoice plus the QR the user needs to pay it.
#[derive(Debug, Clone)]
pub struct InvoiceHandle {
    pub invoice: Invoice,
    pub qr_png: Vec<u8>,
}

/// Result of asking for a top-up invoice. With more than one backend enabled
/// and no preference stated, the caller must prompt the user first.
#[derive(Debug)]
pub enum InvoiceCreation {
    Created(InvoiceHandle),
    ChooseBackend(Vec<PayChannel>),
}

/// Outcome of a settlement attempt. Both the poller and the webhook funnel
/// through `settle`; whichever arrives second observes `AlreadySettled` and
/// does nothing further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Credited { amount: i64, new_balance: i64 },
    AlreadySettled,
}

/// Tick interval and wall-clock deadline for the per-invoice status poller.
#[derive(Debug, Clone, Copy)]
pub struct PollTimings {
    pub tick: Duration,
    pub deadline: Duration,
}

/// Creates invoices, races a poller against inbound webhook notifications and
/// performs the single authoritative credit through the ledger.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    store: Store,
    ledger: Ledger,
    backends: Vec<Arc<dyn PaymentBackend>>,
    topup: TopupConfig,
    timings: PollTimings,
    // invoice ids with a live poll task; a tick first checks membership, so
    // removal is the cooperative cancellation signal
    active_polls: Arc<Mutex<HashSet<String>>>,
}

impl PaymentOrchestrator {
    pub fn new(
        store: Store,
        ledger: Ledger,
        backends: Vec<Arc<dyn PaymentBackend>>,
        topup: TopupConfig,
        timings: PollTimings,
    ) -> Self {
        Self {
            store,
            ledger,
            backends,
            topup,
            timings,
            active_polls: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn enabled_channels(&self) -> Vec<PayChannel> {
        self.backends.iter().map(|b| b.channel()).collect()
    }

    pub fn invoice(&self, invoice_id: &str) -> ShopResult<Option<Invoice>> {
        self.store.get_invoice(invoice_id)
    }

    pub fn recent_settled(&self, limit: usize) -> ShopResult<Vec<Invoice>> {
        self.store.recent_paid_invoices(limit)
    }

    fn backend_for(&self, channel: PayChannel) -> ShopResult<&Arc<dyn PaymentBackend>> {
        self.backends
            .iter()
            .find(|b| b.channel() == channel)
            .ok_or(ShopError::BackendDisabled)
    }

    /// Create a top-up invoice. Amount is validated against the configured
    /// range first; with several backends enabled and no preference the
    /// caller gets the channel list back instead of an eager invoice.
    pub async fn create_invoice(
        &self,
        user_id: &str,
        amount: i64,
        preference: Option<PayChannel>,
    ) -> ShopResult<InvoiceCreation> {
        if amount < self.topup.min_amount || amount > self.topup.max_amount {
            return Err(ShopError::AmountOutOfRange {
                min: self.topup.min_amount,
                max: self.topup.max_amount,
            });
        }
        if self.backends.is_empty() {
            return Err(ShopError::AllBackendsDisabled);
        }

        let backend = match preference {
            Some(channel) => self.backend_for(channel)?,
            None if self.backends.len() == 1 => &self.backends[0],
            None => return Ok(InvoiceCreation::ChooseBackend(self.enabled_channels())),
        };

        let CreatedInvoice { id, qr_png } = backend.create(amount, user_id).await?;
        let invoice = self
            .store
            .insert_invoice(&id, user_id, amount, backend.channel())?;
        self.register_poll(&id);
        info!(
            invoice_id = %invoice.id,
            user_id,
            amount,
            channel = backend.channel().as_str(),
            "invoice created"
        );
        Ok(InvoiceCreation::Created(InvoiceHandle { invoice, qr_png }))
    }

    /// Idempotent settlement. The pending → paid transition is a guarded
    /// update keyed on the invoice id; only the caller that wins it posts the
    /// credit. Late calls, including webhooks for invoices the poller already
    /// expired, observe `AlreadySettled`.
    pub fn settle(&self, invoice_id: &str) -> ShopResult<Settlement> {
        let invoice = self
            .store
            .get_invoice(invoice_id)?
            .ok_or_else(|| ShopError::NotFound(format!("invoice {invoice_id}")))?;

        if !self.store.try_transition_invoice(invoice_id, InvoiceStatus::Paid)? {
            return Ok(Settlement::AlreadySettled);
        }
        self.cancel_poll(invoice_id);

        let change = self.ledger.credit(
            &invoice.user_id,
            invoice.amount,
            invoice.channel.topup_reason(),
            Some(invoice_id),
        )?;
        info!(
            invoice_id,
            user_id = %invoice.user_id,
            amount = invoice.amount,
            new_balance = change.new,
            "invoice settled"
        );
        Ok(Settlement::Credited {
            amount: invoice.amount,
            new_balance: change.new,
        })
    }

    /// Expire an unpaid invoice. Returns false if it already reached a
    /// terminal state, in which case nothing changes.
    pub fn expire(&self, invoice_id: &str) -> ShopResult<bool> {
        self.cancel_poll(invoice_id);
        self.store
            .try_transition_invoice(invoice_id, InvoiceStatus::Expired)
    }

    /// Remove an invoice from the active-poll set. The next tick of its poll
    /// task sees the absence and exits; cancelling never marks anything paid.
    pub fn cancel_poll(&self, invoice_id: &str) -> bool {
        self.active_polls
            .lock()
            .map(|mut polls| polls.remove(invoice_id))
            .unwrap_or(false)
    }

    pub fn is_polling(&self, invoice_id: &str) -> bool {
        self.active_polls
            .lock()
            .map(|polls| polls.contains(invoice_id))
            .unwrap_or(false)
    }

    fn register_poll(&self, invoice_id: &str) {
        if let Ok(mut polls) = self.active_polls.lock() {
            polls.insert(invoice_id.to_string());
        }
    }

    /// Spawn the status poller for an invoice. Runs until settlement, the
    /// wall-clock deadline, or cooperative cancellation via `cancel_poll`.
    /// Terminal outcomes are reported to the user's chat; the QR message is
    /// cleaned up either way.
    pub fn spawn_poll(
        &self,
        invoice: Invoice,
        chat_id: i64,
        qr_message_id: i64,
        transport: Arc<dyn ChatTransport>,
    ) {
        self.register_poll(&invoice.id);
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator
                .run_poll(invoice, chat_id, qr_message_id, transport)
                .await;
        });
    }

    async fn run_poll(
        &self,
        invoice: Invoice,
        chat_id: i64,
        qr_message_id: i64,
        transport: Arc<dyn ChatTransport>,
    ) {
        let backend = match self.backend_for(invoice.channel) {
            Ok(backend) => Arc::clone(backend),
            Err(_) => {
                warn!(invoice_id = %invoice.id, "no backend for channel, dropping poll");
                self.cancel_poll(&invoice.id);
                return;
            }
        };

        let deadline = Instant::now() + self.timings.deadline;
        let mut ticker = interval(self.timings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately

        loop {
            ticker.tick().await;

            if !self.is_polling(&invoice.id) {
                return; // cancelled, or the webhook settled it first
            }

            if Instant::now() >= deadline {
                match self.expire(&invoice.id) {
                    Ok(true) => {
                        info!(invoice_id = %invoice.id, "invoice expired unpaid");
                        let _ = transport.delete_message(chat_id, qr_message_id).await;
                        let _ = transport
                            .send_message(
                                chat_id,
                                "Your top-up invoice expired before payment arrived. \
                                 No balance was charged; start a new top-up any time.",
                                None,
                            )
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(invoice_id = %invoice.id, "expiry failed: {e}"),
                }
                return;
            }

            let paid = match backend.is_paid(&invoice.id).await {
                Ok(paid) => paid,
                Err(e) => {
                    // transient backend hiccup, try again next tick
                    warn!(invoice_id = %invoice.id, "status poll failed: {e}");
                    continue;
                }
            };
            if !paid {
                continue;
            }

            match self.settle(&invoice.id) {
                Ok(Settlement::Credited { amount, new_balance }) => {
                    let _ = transport.delete_message(chat_id, qr_message_id).await;
                    let _ = transport
                        .send_message(
                            chat_id,
                            &format!(
                                "Payment received: +{amount}. Your balance is now {new_balance}."
                            ),
                            None,
                        )
                        .await;
                }
                Ok(Settlement::AlreadySettled) => {
                    // the webhook won the race and already notified the user
                }
                Err(e) => warn!(invoice_id = %invoice.id, "settlement failed: {e}"),
            }
            return;
        }
    }
}
