use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::SweeperConfig;
use crate::error::ShopResult;
use crate::provisioning::ProvisioningCoordinator;
use crate::store::models::Lease;
use crate::store::Store;
use crate::transport::ChatTransport;

/// Periodic reconciliation of lease expiry against the clock. Two passes on
/// independent schedules: an hourly one over paid leases (reminders, then
/// hard deletes) and a minute-scale one over trials (remote revoke, then
/// delete regardless).
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Store,
    coordinator: ProvisioningCoordinator,
    transport: Arc<dyn ChatTransport>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(
        store: Store,
        coordinator: ProvisioningCoordinator,
        transport: Arc<dyn ChatTransport>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            transport,
            config,
        }
    }

    pub async fn run(self) {
        let paid = self.clone();
        let paid_interval = Duration::from_secs(self.config.paid_sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = interval(paid_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = paid.run_paid_pass(Utc::now()).await {
                    warn!("paid sweep pass failed: {e}");
                }
            }
        });

        let mut ticker = interval(Duration::from_secs(self.config.trial_sweep_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_trial_pass(Utc::now()).await {
                warn!("trial sweep pass failed: {e}");
            }
        }
    }

    /// One pass over paid leases at the given instant: send the one-time
    /// reminder for leases inside the look-ahead window, then delete rows
    /// past expiry. Paid deletes skip the remote revoke; the panel expires
    /// those accounts on its own schedule.
    pub async fn run_paid_pass(&self, now: DateTime<Utc>) -> ShopResult<()> {
        let window_end = now + ChronoDuration::days(self.config.reminder_lookahead_days);
        for lease in self.store.paid_leases_needing_reminder(now, window_end)? {
            if let Err(e) = self.send_reminder(&lease).await {
                // skip this recipient, keep sweeping
                warn!(lease_id = lease.id, "reminder send failed: {e}");
                continue;
            }
            self.store.mark_reminder_sent(lease.id)?;
        }

        for lease in self.store.expired_paid_leases(now)? {
            // The delete re-checks expiry: a renewal that lands while this
            // pass is awaiting notifications pushes the row out of the
            // condition and the lease survives.
            if !self.store.delete_lease_if_expired(lease.id, now)? {
                info!(
                    lease_id = lease.id,
                    username = %lease.username,
                    "lease renewed mid-pass, keeping it"
                );
                continue;
            }
            info!(
                lease_id = lease.id,
                username = %lease.username,
                "expired paid lease removed"
            );
            self.notify(
                &lease,
                &format!(
                    "Your {} account '{}' has expired and was removed.",
                    lease.protocol.as_str(),
                    lease.username
                ),
            )
            .await;
        }
        Ok(())
    }

    /// One pass over trial leases: best-effort remote revoke, then delete the
    /// row unconditionally. A trial must never linger past expiry even when
    /// the panel call fails.
    pub async fn run_trial_pass(&self, now: DateTime<Utc>) -> ShopResult<()> {
        for lease in self.store.expired_trial_leases(now)? {
            if self.coordinator.revoke_remote(&lease).await.is_err() {
                warn!(
                    lease_id = lease.id,
                    username = %lease.username,
                    "trial revoke failed remotely, deleting row anyway"
                );
            }
            if self.store.delete_lease_if_expired(lease.id, now)? {
                info!(
                    lease_id = lease.id,
                    username = %lease.username,
                    "expired trial removed"
                );
            }
        }
        Ok(())
    }

    async fn send_reminder(&self, lease: &Lease) -> anyhow::Result<()> {
        let chat_id: i64 = lease.user_id.parse()?;
        let days_left = (lease.expires_at - Utc::now()).num_days().max(0);
        self.transport
            .send_message(
                chat_id,
                &format!(
                    "Heads up: your {} account '{}' expires in {} day(s). \
                     Renew it from the menu to keep it running.",
                    lease.protocol.as_str(),
                    lease.username,
                    days_left
                ),
                None,
            )
            .await?;
        Ok(())
    }

    async fn notify(&self, lease: &Lease, text: &str) {
        if let Ok(chat_id) = lease.user_id.parse::<i64>() {
            if let Err(e) = self.transport.send_message(chat_id, text, None).await {
                warn!(lease_id = lease.id, "expiry notice failed: {e}");
            }
        }
    }
}
