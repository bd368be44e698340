pub mod api;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::config::TrialConfig;
use crate::error::{ShopError, ShopResult};
use crate::ledger::Ledger;
use crate::store::models::{Lease, Protocol, Role, ServerRecord, User};
use crate::store::Store;
use api::{AccountMetadata, ProvisioningApi};

/// Remote panel calls are bounded; past this the operation aborts with no
/// financial effect.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

const RENEWAL_DAYS: i64 = 30;

/// Turns validated purchase/renewal/trial requests into remote panel calls
/// and lease records. Debits are posted only after the remote call succeeds,
/// so a failed or timed-out provisioning never charges the user.
#[derive(Clone)]
pub struct ProvisioningCoordinator {
    store: Store,
    ledger: Ledger,
    panel: Arc<dyn ProvisioningApi>,
    trial: TrialConfig,
}

impl ProvisioningCoordinator {
    pub fn new(
        store: Store,
        ledger: Ledger,
        panel: Arc<dyn ProvisioningApi>,
        trial: TrialConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            panel,
            trial,
        }
    }

    fn require_user(&self, user_id: &str) -> ShopResult<User> {
        self.store
            .get_user(user_id)?
            .ok_or_else(|| ShopError::NotFound(format!("user {user_id}")))
    }

    fn require_server(&self, server_id: &str) -> ShopResult<ServerRecord> {
        self.store
            .get_server(server_id)?
            .ok_or_else(|| ShopError::NotFound(format!("server {server_id}")))
    }

    fn price(&self, server_id: &str, protocol: Protocol, role: Role, days: i64) -> ShopResult<i64> {
        let per_30d = self
            .store
            .price_for(server_id, protocol, role)?
            .ok_or_else(|| {
                ShopError::Validation(format!(
                    "{} is not offered on {server_id}",
                    protocol.as_str()
                ))
            })?;
        Ok(per_30d * days / 30)
    }

    /// Create a paid account. Balance sufficiency is checked before the
    /// remote call; the debit is posted only after it succeeds.
    pub async fn purchase(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
        duration_days: i64,
        username: &str,
        password: Option<&str>,
    ) -> ShopResult<(Lease, AccountMetadata)> {
        let user = self.require_user(user_id)?;
        let server = self.require_server(server_id)?;
        let price = self.price(server_id, protocol, user.role, duration_days)?;

        if user.balance < price {
            return Err(ShopError::InsufficientBalance {
                required: price,
                available: user.balance,
            });
        }
        if self.store.lease_username_taken(username)? {
            return Err(ShopError::Validation(format!(
                "username '{username}' is already taken"
            )));
        }

        let secret = match password {
            Some(password) => password.to_string(),
            None => random_token(12),
        };
        let metadata = bounded(self.panel.create_account(
            &server,
            protocol,
            username,
            &secret,
            duration_days,
        ))
        .await?;

        // Debit and lease row land in one transaction; a username that was
        // claimed while the remote call was in flight rolls both back.
        let lease = self.ledger.charge_purchase(
            user_id,
            server_id,
            protocol,
            username,
            price,
            Utc::now() + ChronoDuration::days(duration_days),
        )?;
        info!(
            user_id,
            server_id,
            protocol = protocol.as_str(),
            username,
            price,
            duration_days,
            "account purchased"
        );
        Ok((lease, metadata))
    }

    /// Extend a paid lease by a fixed 30-day increment, priced from the
    /// current table. Same success-gated debit ordering as purchase.
    pub async fn renew(&self, user_id: &str, lease_id: i64) -> ShopResult<Lease> {
        let user = self.require_user(user_id)?;
        let lease = self
            .store
            .get_lease(lease_id)?
            .filter(|l| l.user_id == user_id && !l.trial)
            .ok_or_else(|| ShopError::NotFound(format!("lease {lease_id}")))?;
        let server = self.require_server(&lease.server_id)?;
        let price = self.price(&lease.server_id, lease.protocol, user.role, RENEWAL_DAYS)?;

        if user.balance < price {
            return Err(ShopError::InsufficientBalance {
                required: price,
                available: user.balance,
            });
        }

        bounded(self.panel.renew_account(&server, lease.protocol, &lease.username, RENEWAL_DAYS))
            .await?;

        // The debit and the expiry extension share one transaction. A spend
        // racing this call can still drain the balance between the check
        // above and here; the transaction then fails and the panel keeps an
        // extension we never charged for, which the warn below surfaces.
        let new_expiry = lease.expires_at + ChronoDuration::days(RENEWAL_DAYS);
        if let Err(e) =
            self.ledger
                .charge_renewal(user_id, lease_id, &lease.username, price, new_expiry)
        {
            warn!(
                user_id,
                lease_id,
                username = %lease.username,
                "renewal charge failed after remote extension: {e}"
            );
            return Err(e);
        }
        info!(
            user_id,
            lease_id,
            username = %lease.username,
            price,
            new_expiry = %new_expiry,
            "lease renewed"
        );

        self.store
            .get_lease(lease_id)?
            .ok_or_else(|| ShopError::NotFound(format!("lease {lease_id}")))
    }

    /// Claim a free minutes-scale trial account. The per-(user, server,
    /// protocol) cooldown is role-dependent; -1 disables it. The claim
    /// timestamp is recorded even when the cooldown is disabled.
    pub async fn claim_trial(
        &self,
        user_id: &str,
        server_id: &str,
        protocol: Protocol,
    ) -> ShopResult<(Lease, AccountMetadata)> {
        if !self.trial.enabled {
            return Err(ShopError::Validation("trial accounts are disabled".into()));
        }
        let user = self.require_user(user_id)?;
        let server = self.require_server(server_id)?;

        let cooldown_hours = self.trial.cooldown_hours_for(user.role);
        let now = Utc::now();
        if cooldown_hours >= 0 {
            if let Some(claimed_at) = self.store.last_trial_claim(user_id, server_id, protocol)? {
                let available_at = claimed_at + ChronoDuration::hours(cooldown_hours);
                if now < available_at {
                    let remaining = available_at - now;
                    return Err(ShopError::Validation(format!(
                        "trial cooldown active, try again in {}h {}m",
                        remaining.num_hours(),
                        remaining.num_minutes() % 60
                    )));
                }
            }
        }

        let username = format!("trial{}", random_token(8));
        let secret = random_token(12);
        let metadata =
            bounded(self.panel.create_account(&server, protocol, &username, &secret, 1)).await?;

        let lease = self.store.insert_lease(
            user_id,
            server_id,
            protocol,
            &username,
            0,
            true,
            now + ChronoDuration::minutes(self.trial.duration_minutes),
        )?;
        self.store
            .record_trial_claim(user_id, server_id, protocol, now)?;
        info!(
            user_id,
            server_id,
            protocol = protocol.as_str(),
            username = %username,
            "trial claimed"
        );
        Ok((lease, metadata))
    }

    /// Best-effort remote revoke for a lease's account. Failure is logged and
    /// returned; the caller decides whether the local row goes away anyway.
    pub async fn revoke_remote(&self, lease: &Lease) -> ShopResult<()> {
        let server = self.require_server(&lease.server_id)?;
        match bounded(self.panel.delete_account(&server, lease.protocol, &lease.username)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    lease_id = lease.id,
                    username = %lease.username,
                    "remote revoke failed: {e}"
                );
                Err(e)
            }
        }
    }
}

async fn bounded<T>(fut: impl Future<Output = ShopResult<T>>) -> ShopResult<T> {
    match tokio::time::timeout(REMOTE_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(ShopError::RemoteTimeout),
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::LedgerReason;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakePanel {
        fail_create: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProvisioningApi for FakePanel {
        async fn create_account(
            &self,
            _server: &ServerRecord,
            protocol: Protocol,
            username: &str,
            _secret: &str,
            _duration_days: i64,
        ) -> ShopResult<AccountMetadata> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create:{}:{username}", protocol.as_str()));
            if self.fail_create {
                return Err(ShopError::RemoteProvisioning("quota exhausted".into()));
            }
            Ok(AccountMetadata {
                raw: json!({ "host": "sg1.example.com", "port": 443 }),
            })
        }

        async fn renew_account(
            &self,
            _server: &ServerRecord,
            _protocol: Protocol,
            username: &str,
            _duration_days: i64,
        ) -> ShopResult<()> {
            self.calls.lock().unwrap().push(format!("renew:{username}"));
            Ok(())
        }

        async fn delete_account(
            &self,
            _server: &ServerRecord,
            _protocol: Protocol,
            username: &str,
        ) -> ShopResult<()> {
            self.calls.lock().unwrap().push(format!("delete:{username}"));
            Ok(())
        }
    }

    fn fixture(panel: Arc<FakePanel>, trial: TrialConfig) -> (TempDir, ProvisioningCoordinator) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.sqlite")).unwrap();
        store.ensure_user("u1", "alice", Role::Standard).unwrap();
        store
            .insert_server(&ServerRecord {
                id: "sg-1".into(),
                name: "SG 1".into(),
                endpoint: "https://sg1.example.com".into(),
                api_token: "tok".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        store
            .set_price("sg-1", Protocol::Vmess, Role::Standard, 15_000)
            .unwrap();
        let ledger = Ledger::new(store.clone());
        let coordinator = ProvisioningCoordinator::new(store, ledger, panel, trial);
        (dir, coordinator)
    }

    fn fund(coordinator: &ProvisioningCoordinator, amount: i64) {
        coordinator
            .ledger
            .credit("u1", amount, LedgerReason::AdminAdd, None)
            .unwrap();
    }

    #[tokio::test]
    async fn purchase_debits_and_creates_lease() {
        let panel = Arc::new(FakePanel::default());
        let (_dir, coordinator) = fixture(Arc::clone(&panel), TrialConfig::default());
        fund(&coordinator, 50_000);

        let (lease, metadata) = coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap();

        assert_eq!(coordinator.ledger.balance("u1").unwrap(), 35_000);
        assert_eq!(lease.price, 15_000);
        assert!(!lease.trial);
        let days_left = (lease.expires_at - Utc::now()).num_days();
        assert!((29..=30).contains(&days_left));
        assert!(metadata.summary().contains("host: sg1.example.com"));
    }

    #[tokio::test]
    async fn remote_failure_leaves_balance_unchanged() {
        let panel = Arc::new(FakePanel {
            fail_create: true,
            ..Default::default()
        });
        let (_dir, coordinator) = fixture(Arc::clone(&panel), TrialConfig::default());
        fund(&coordinator, 50_000);

        let err = coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ShopError::RemoteProvisioning(_)));
        assert_eq!(coordinator.ledger.balance("u1").unwrap(), 50_000);
        assert!(coordinator.store.get_lease(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn insufficient_balance_never_reaches_remote() {
        let panel = Arc::new(FakePanel::default());
        let (_dir, coordinator) = fixture(Arc::clone(&panel), TrialConfig::default());
        fund(&coordinator, 10_000);

        let err = coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShopError::InsufficientBalance {
                required: 15_000,
                available: 10_000
            }
        ));
        assert!(panel.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn taken_username_never_reaches_remote() {
        let panel = Arc::new(FakePanel::default());
        let (_dir, coordinator) = fixture(Arc::clone(&panel), TrialConfig::default());
        fund(&coordinator, 50_000);

        coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap();
        let err = coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        // first attempt paid, second left the balance and panel untouched
        assert_eq!(coordinator.ledger.balance("u1").unwrap(), 35_000);
        assert_eq!(panel.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn renewal_extends_expiry_thirty_days() {
        let panel = Arc::new(FakePanel::default());
        let (_dir, coordinator) = fixture(Arc::clone(&panel), TrialConfig::default());
        fund(&coordinator, 50_000);

        let (lease, _) = coordinator
            .purchase("u1", "sg-1", Protocol::Vmess, 30, "alice01", None)
            .await
            .unwrap();
        let renewed = coordinator.renew("u1", lease.id).await.unwrap();

        assert_eq!(renewed.expires_at, lease.expires_at + ChronoDuration::days(30));
        assert_eq!(coordinator.ledger.balance("u1").unwrap(), 20_000);
        assert!(!renewed.reminder_sent);
    }

    #[tokio::test]
    async fn trial_cooldown_blocks_and_releases() {
        let panel = Arc::new(FakePanel::default());
        let trial = TrialConfig {
            enabled: true,
            ..TrialConfig::default()
        };
        let (_dir, coordinator) = fixture(Arc::clone(&panel), trial);

        let (lease, _) = coordinator
            .claim_trial("u1", "sg-1", Protocol::Vmess)
            .await
            .unwrap();
        assert!(lease.trial);
        assert_eq!(lease.price, 0);

        // second claim an hour into a 24h cooldown is rejected
        let err = coordinator
            .claim_trial("u1", "sg-1", Protocol::Vmess)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        // backdate the claim past the window and it succeeds again
        coordinator
            .store
            .record_trial_claim(
                "u1",
                "sg-1",
                Protocol::Vmess,
                Utc::now() - ChronoDuration::hours(25),
            )
            .unwrap();
        coordinator
            .claim_trial("u1", "sg-1", Protocol::Vmess)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn admin_sentinel_disables_cooldown_but_still_records() {
        let panel = Arc::new(FakePanel::default());
        let trial = TrialConfig {
            enabled: true,
            ..TrialConfig::default()
        };
        let (_dir, coordinator) = fixture(Arc::clone(&panel), trial);
        coordinator.store.set_role("u1", Role::Admin).unwrap();

        coordinator
            .claim_trial("u1", "sg-1", Protocol::Vmess)
            .await
            .unwrap();
        coordinator
            .claim_trial("u1", "sg-1", Protocol::Vmess)
            .await
            .unwrap();

        assert!(coordinator
            .store
            .last_trial_claim("u1", "sg-1", Protocol::Vmess)
            .unwrap()
            .is_some());
    }
}
