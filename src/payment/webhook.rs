use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::transport::ChatTransport;

use super::{PaymentOrchestrator, Settlement};

/// Shared state for the inbound payment-notification endpoint.
#[derive(Clone)]
pub struct WebhookState {
    pub payments: Arc<PaymentOrchestrator>,
    pub transport: Arc<dyn ChatTransport>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentNotification {
    pub invoice_id: String,
    pub status: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub amount: Option<i64>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/payment/notify", post(handle_notification))
        .with_state(state)
}

pub async fn serve(bind: &str, state: WebhookState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("payment webhook listening on {bind}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Inbound push confirmations race the poller for the same invoice; both run
/// the same idempotent settlement, so a duplicate or late notification is
/// acknowledged and dropped.
async fn handle_notification(
    State(state): State<WebhookState>,
    Json(payload): Json<PaymentNotification>,
) -> (StatusCode, Json<Value>) {
    if payload.status != "paid" {
        return (StatusCode::OK, Json(json!({ "ok": true, "ignored": true })));
    }

    let invoice = match state.payments.invoice(&payload.invoice_id) {
        Ok(Some(invoice)) => invoice,
        Ok(None) => {
            warn!(invoice_id = %payload.invoice_id, "notification for unknown invoice");
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "ok": false, "error": "unknown invoice" })),
            );
        }
        Err(e) => {
            warn!(invoice_id = %payload.invoice_id, "invoice lookup failed: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false })),
            );
        }
    };

    match state.payments.settle(&payload.invoice_id) {
        Ok(Settlement::Credited { amount, new_balance }) => {
            if let Ok(chat_id) = invoice.user_id.parse::<i64>() {
                let _ = state
                    .transport
                    .send_message(
                        chat_id,
                        &format!(
                            "Payment received: +{amount}. Your balance is now {new_balance}."
                        ),
                        None,
                    )
                    .await;
            }
            (StatusCode::OK, Json(json!({ "ok": true, "credited": true })))
        }
        // poller won, or the invoice already expired; either way the push is
        // absorbed without a second credit or a second notification
        Ok(Settlement::AlreadySettled) => {
            (StatusCode::OK, Json(json!({ "ok": true, "credited": false })))
        }
        Err(e) => {
            warn!(invoice_id = %payload.invoice_id, "webhook settlement failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false })),
            )
        }
    }
}
