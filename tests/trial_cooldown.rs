//! Trial claims: per-(user, server, protocol) cooldown, role sentinel, and
//! unconditional claim recording.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use kedai::config::TrialConfig;
use kedai::ledger::Ledger;
use kedai::provisioning::ProvisioningCoordinator;
use kedai::store::models::{Protocol, Role};
use kedai::store::Store;

use common::{seeded_store, FakePanel};

fn coordinator(trial: TrialConfig) -> (tempfile::TempDir, ProvisioningCoordinator, Store) {
    let (dir, store) = seeded_store();
    let ledger = Ledger::new(store.clone());
    let coordinator = ProvisioningCoordinator::new(
        store.clone(),
        ledger,
        Arc::new(FakePanel::default()),
        trial,
    );
    (dir, coordinator, store)
}

fn enabled() -> TrialConfig {
    TrialConfig {
        enabled: true,
        ..TrialConfig::default()
    }
}

#[tokio::test]
async fn cooldown_blocks_then_releases_after_window() {
    let (_dir, coordinator, store) = coordinator(enabled());

    let (lease, _) = coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();
    assert!(lease.trial);
    assert_eq!(lease.price, 0);
    let minutes = (lease.expires_at - Utc::now()).num_minutes();
    assert!((55..=60).contains(&minutes), "trial lives {minutes} minutes");

    // one hour into the default 24h window: rejected
    store
        .record_trial_claim(
            "100",
            "sg-1",
            Protocol::Vmess,
            Utc::now() - Duration::hours(1),
        )
        .unwrap();
    let err = coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    // 25 simulated hours later: allowed again
    store
        .record_trial_claim(
            "100",
            "sg-1",
            Protocol::Vmess,
            Utc::now() - Duration::hours(25),
        )
        .unwrap();
    coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();
}

#[tokio::test]
async fn cooldown_is_scoped_to_the_triple() {
    let (_dir, coordinator, store) = coordinator(enabled());

    coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();

    // a different protocol on the same server is a different cooldown key
    coordinator
        .claim_trial("100", "sg-1", Protocol::Vless)
        .await
        .unwrap();

    // and a different user is unaffected entirely
    store.ensure_user("200", "bob", Role::Standard).unwrap();
    coordinator
        .claim_trial("200", "sg-1", Protocol::Vmess)
        .await
        .unwrap();
}

#[tokio::test]
async fn sentinel_disables_cooldown_but_claims_are_still_recorded() {
    let (_dir, coordinator, store) = coordinator(enabled());
    store.set_role("100", Role::Admin).unwrap();

    coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();
    coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();

    // the record exists, so re-enabling the cooldown later works immediately
    let claimed_at = store
        .last_trial_claim("100", "sg-1", Protocol::Vmess)
        .unwrap()
        .unwrap();
    assert!(Utc::now() - claimed_at < Duration::minutes(1));
}

#[tokio::test]
async fn reseller_uses_shorter_window() {
    let (_dir, coordinator, store) = coordinator(enabled());
    store.set_role("100", Role::Reseller).unwrap();

    // 7 hours ago is outside the 6h reseller window but inside the 24h
    // standard one
    store
        .record_trial_claim(
            "100",
            "sg-1",
            Protocol::Vmess,
            Utc::now() - Duration::hours(7),
        )
        .unwrap();
    coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap();
}

#[tokio::test]
async fn disabled_trials_reject_claims() {
    let (_dir, coordinator, _store) = coordinator(TrialConfig::default());
    let err = coordinator
        .claim_trial("100", "sg-1", Protocol::Vmess)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}
