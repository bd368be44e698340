use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::{DonationConfig, GatewayConfig};
use crate::error::{ShopError, ShopResult};
use crate::store::models::PayChannel;

/// What a backend hands back on invoice creation: its id (the key the
/// settlement log is deduplicated on) and a QR image to show the user.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    pub id: String,
    pub qr_png: Vec<u8>,
}

/// A payment channel the orchestrator can create invoices against and query
/// for status. Implementations own their HTTP details; the core only sees
/// create/is_paid.
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    fn channel(&self) -> PayChannel;

    async fn create(&self, amount: i64, user_id: &str) -> ShopResult<CreatedInvoice>;

    async fn is_paid(&self, invoice_id: &str) -> ShopResult<bool>;
}

/// Hosted payment gateway: create an invoice, fetch its QR, poll its status.
pub struct GatewayBackend {
    client: Client,
    base_url: String,
    api_token: String,
}

#[derive(Deserialize)]
struct GatewayInvoice {
    id: String,
}

#[derive(Deserialize)]
struct GatewayStatus {
    status: String,
}

impl GatewayBackend {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        }
    }
}

#[async_trait]
impl PaymentBackend for GatewayBackend {
    fn channel(&self) -> PayChannel {
        PayChannel::Gateway
    }

    async fn create(&self, amount: i64, user_id: &str) -> ShopResult<CreatedInvoice> {
        let resp = self
            .client
            .post(format!("{}/api/v1/invoices", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&json!({ "amount": amount, "note": format!("topup:{user_id}") }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ShopError::RemoteProvisioning(format!(
                "gateway invoice creation failed: {}",
                resp.status()
            )));
        }
        let invoice: GatewayInvoice = resp.json().await?;

        let qr = self
            .client
            .get(format!("{}/api/v1/invoices/{}/qr", self.base_url, invoice.id))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        Ok(CreatedInvoice {
            id: invoice.id,
            qr_png: qr.to_vec(),
        })
    }

    async fn is_paid(&self, invoice_id: &str) -> ShopResult<bool> {
        let status: GatewayStatus = self
            .client
            .get(format!("{}/api/v1/invoices/{invoice_id}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status.status == "paid")
    }
}

/// Static-account QR donations. The provider has no invoice concept, so we
/// mint our own transaction id and ask it for a QR bound to that amount; paid
/// checks go against the provider's mutation list.
pub struct DonationBackend {
    client: Client,
    account: String,
}

#[derive(Deserialize)]
struct DonationPaid {
    paid: bool,
}

impl DonationBackend {
    pub fn new(config: &DonationConfig) -> Self {
        Self {
            client: Client::new(),
            account: config.account.clone(),
        }
    }

    fn qr_url(&self, transaction_id: &str, amount: i64) -> String {
        format!(
            "https://donate.example.id/api/qr/{}?amount={}&ref={}",
            self.account, amount, transaction_id
        )
    }

    fn check_url(&self, transaction_id: &str) -> String {
        format!(
            "https://donate.example.id/api/paid/{}/{}",
            self.account, transaction_id
        )
    }
}

#[async_trait]
impl PaymentBackend for DonationBackend {
    fn channel(&self) -> PayChannel {
        PayChannel::Donation
    }

    async fn create(&self, amount: i64, _user_id: &str) -> ShopResult<CreatedInvoice> {
        let transaction_id = format!("don-{}", Uuid::new_v4());
        let qr = self
            .client
            .get(self.qr_url(&transaction_id, amount))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(CreatedInvoice {
            id: transaction_id,
            qr_png: qr.to_vec(),
        })
    }

    async fn is_paid(&self, invoice_id: &str) -> ShopResult<bool> {
        let resp: DonationPaid = self
            .client
            .get(self.check_url(invoice_id))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.paid)
    }
}
