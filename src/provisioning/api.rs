use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::error::{ShopError, ShopResult};
use crate::store::models::{Protocol, ServerRecord};

/// Protocol-specific connection details returned by the remote panel. The
/// payload is opaque to the core and passed through to the user verbatim;
/// only `summary` flattens it for chat display.
#[derive(Debug, Clone)]
pub struct AccountMetadata {
    pub raw: Value,
}

impl AccountMetadata {
    /// Render the top-level fields as `key: value` lines, skipping nested
    /// structures the panel may tack on.
    pub fn summary(&self) -> String {
        match self.raw.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(key, value)| {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some(format!("{key}: {rendered}"))
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => self.raw.to_string(),
        }
    }
}

/// The remote account lifecycle, per server record. One implementation talks
/// to the real panels; tests substitute a recording fake.
#[async_trait]
pub trait ProvisioningApi: Send + Sync {
    async fn create_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
        secret: &str,
        duration_days: i64,
    ) -> ShopResult<AccountMetadata>;

    async fn renew_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
        duration_days: i64,
    ) -> ShopResult<()>;

    async fn delete_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
    ) -> ShopResult<()>;
}

/// HTTP client against a server's management panel.
pub struct RemotePanelClient {
    client: Client,
}

impl RemotePanelClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn call(
        &self,
        server: &ServerRecord,
        path: &str,
        body: Value,
    ) -> ShopResult<Value> {
        let url = format!("{}/{}", server.endpoint.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&server.api_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let payload: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            // panels put a human-readable reason in `message`; surface it
            let message = payload["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("panel returned {status}"));
            return Err(ShopError::RemoteProvisioning(message));
        }
        Ok(payload)
    }
}

impl Default for RemotePanelClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningApi for RemotePanelClient {
    async fn create_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
        secret: &str,
        duration_days: i64,
    ) -> ShopResult<AccountMetadata> {
        let raw = self
            .call(
                server,
                &format!("api/{}/create", protocol.as_str()),
                json!({
                    "username": username,
                    "secret": secret,
                    "days": duration_days,
                }),
            )
            .await?;
        Ok(AccountMetadata { raw })
    }

    async fn renew_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
        duration_days: i64,
    ) -> ShopResult<()> {
        self.call(
            server,
            &format!("api/{}/renew", protocol.as_str()),
            json!({ "username": username, "days": duration_days }),
        )
        .await?;
        Ok(())
    }

    async fn delete_account(
        &self,
        server: &ServerRecord,
        protocol: Protocol,
        username: &str,
    ) -> ShopResult<()> {
        self.call(
            server,
            &format!("api/{}/delete", protocol.as_str()),
            json!({ "username": username }),
        )
        .await?;
        Ok(())
    }
}
