//! Single-slot conversation registry: one active flow per user, last start
//! wins, idempotent cancellation, rejection without state change.

mod common;

use kedai::config::TopupConfig;
use kedai::conversation::{
    Advance, AdjustMode, CompletedFlow, ConversationRegistry, FlowKind, MessageRef,
};
use kedai::store::models::{PayChannel, Protocol};

use common::seeded_store;

fn registry() -> (tempfile::TempDir, ConversationRegistry) {
    let (dir, store) = seeded_store();
    (dir, ConversationRegistry::new(store, TopupConfig::default()))
}

fn msg() -> MessageRef {
    MessageRef {
        chat_id: 100,
        message_id: 1,
    }
}

#[tokio::test]
async fn exactly_one_entry_per_user() {
    let (_dir, registry) = registry();

    registry
        .begin("100", FlowKind::Topup { channel: None }, msg())
        .await;
    registry.begin("100", FlowKind::RegisterServer, msg()).await;
    registry.begin("100", FlowKind::Broadcast, msg()).await;

    // still exactly one flow, and it is the newest
    assert!(registry.is_active("100").await);
    let advance = registry.advance("100", "maintenance tonight").await.unwrap();
    assert!(matches!(
        advance,
        Some(Advance::Complete(CompletedFlow::Broadcast { .. }))
    ));
    assert!(!registry.is_active("100").await);
}

#[tokio::test]
async fn cancel_twice_equals_cancel_once() {
    let (_dir, registry) = registry();
    registry
        .begin("100", FlowKind::Topup { channel: None }, msg())
        .await;

    assert!(registry.cancel("100").await);
    assert!(!registry.cancel("100").await);
    assert!(registry.advance("100", "50000").await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_input_retries_same_step() {
    let (_dir, registry) = registry();
    registry
        .begin(
            "100",
            FlowKind::Topup {
                channel: Some(PayChannel::Gateway),
            },
            msg(),
        )
        .await;

    for bad in ["zero", "-5", "1"] {
        let advance = registry.advance("100", bad).await.unwrap().unwrap();
        assert!(matches!(advance, Advance::Rejected { .. }));
        assert!(registry.is_active("100").await);
    }

    let advance = registry.advance("100", "50000").await.unwrap().unwrap();
    assert!(matches!(
        advance,
        Advance::Complete(CompletedFlow::Topup {
            amount: 50_000,
            channel: Some(PayChannel::Gateway)
        })
    ));
}

#[tokio::test]
async fn multi_step_wizard_accumulates_fields() {
    let (_dir, registry) = registry();
    registry.begin("100", FlowKind::RegisterServer, msg()).await;

    let steps = [
        ("de-2", true),
        ("Frankfurt 2", true),
        ("ftp://nope", false),
        ("https://de2.example.com", true),
    ];
    for (input, accepted) in steps {
        let advance = registry.advance("100", input).await.unwrap().unwrap();
        match advance {
            Advance::Next { .. } => assert!(accepted),
            Advance::Rejected { .. } => assert!(!accepted),
            Advance::Complete(_) => panic!("finished early"),
        }
    }

    let advance = registry.advance("100", "panel-token").await.unwrap().unwrap();
    match advance {
        Advance::Complete(CompletedFlow::RegisterServer {
            id,
            name,
            endpoint,
            api_token,
        }) => {
            assert_eq!(id, "de-2");
            assert_eq!(name, "Frankfurt 2");
            assert_eq!(endpoint, "https://de2.example.com");
            assert_eq!(api_token, "panel-token");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_server_id_rejected_mid_flow() {
    let (_dir, registry) = registry();
    registry.begin("100", FlowKind::RegisterServer, msg()).await;

    // sg-1 already exists in the seeded store
    let advance = registry.advance("100", "sg-1").await.unwrap().unwrap();
    assert!(matches!(advance, Advance::Rejected { .. }));

    let advance = registry.advance("100", "sg-2").await.unwrap().unwrap();
    assert!(matches!(advance, Advance::Next { .. }));
}

#[tokio::test]
async fn balance_adjust_resolves_target_then_amount() {
    let (_dir, registry) = registry();
    registry
        .begin(
            "100",
            FlowKind::BalanceAdjust {
                mode: AdjustMode::Set,
            },
            msg(),
        )
        .await;

    let advance = registry.advance("100", "404").await.unwrap().unwrap();
    assert!(matches!(advance, Advance::Rejected { .. }));

    let advance = registry.advance("100", "100").await.unwrap().unwrap();
    assert!(matches!(advance, Advance::Next { .. }));

    let advance = registry.advance("100", "75000").await.unwrap().unwrap();
    assert!(matches!(
        advance,
        Advance::Complete(CompletedFlow::AdjustBalance {
            mode: AdjustMode::Set,
            amount: 75_000,
            ..
        })
    ));
}

#[tokio::test]
async fn ssh_purchase_collects_password() {
    let (_dir, registry) = registry();
    registry
        .begin(
            "100",
            FlowKind::PurchaseCredentials {
                server_id: "sg-1".into(),
                protocol: Protocol::Ssh,
                duration_days: 30,
            },
            msg(),
        )
        .await;

    let advance = registry.advance("100", "alice01").await.unwrap().unwrap();
    assert!(matches!(advance, Advance::Next { .. }));

    let advance = registry.advance("100", "hunter22").await.unwrap().unwrap();
    match advance {
        Advance::Complete(CompletedFlow::Purchase {
            username, password, ..
        }) => {
            assert_eq!(username, "alice01");
            assert_eq!(password.as_deref(), Some("hunter22"));
        }
        other => panic!("unexpected: {other:?}"),
    }
}
