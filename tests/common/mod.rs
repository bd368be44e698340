#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use kedai::error::{ShopError, ShopResult};
use kedai::payment::backends::{CreatedInvoice, PaymentBackend};
use kedai::provisioning::api::{AccountMetadata, ProvisioningApi};
use kedai::store::models::{PayChannel, Protocol, Role, ServerRecord};
use kedai::store::Store;
use kedai::transport::{ChatTransport, Keyboard};

/// Store seeded with one user and one priced server.
pub fn seeded_store() -> (TempDir, Store) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("kedai.sqlite")).unwrap();
    store.ensure_user("100", "alice", Role::Standard).unwrap();
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
    (dir, store)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: i64,
    pub text: String,
}

/// Records every outbound effect; message ids count up from 1.
#[derive(Default)]
pub struct FakeTransport {
    next_id: AtomicI64,
    pub sent: Mutex<Vec<SentMessage>>,
    pub deleted: Mutex<Vec<(i64, i64)>>,
    pub fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        _keyboard: Option<Keyboard>,
    ) -> Result<i64> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        _message_id: i64,
        text: &str,
        _keyboard: Option<Keyboard>,
    ) -> Result<()> {
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.deleted.lock().unwrap().push((chat_id, message_id));
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        _png: Vec<u8>,
        caption: &str,
        _keyboard: Option<Keyboard>,
    ) -> Result<i64> {
        self.sent.lock().unwrap().push(SentMessage {
            chat_id,
            text: caption.to_string(),
        });
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn answer_callback(&self, _callback_id: &str, _text: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// In-memory payment backend; paid status is flipped by the test.
pub struct FakeBackend {
    pub channel: PayChannel,
    pub paid: AtomicBool,
    counter: AtomicI64,
}

impl FakeBackend {
    pub fn new(channel: PayChannel) -> Self {
        Self {
            channel,
            paid: AtomicBool::new(false),
            counter: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl PaymentBackend for FakeBackend {
    fn channel(&self) -> PayChannel {
        self.channel
    }

    async fn create(&self, _amount: i64, _user_id: &str) -> ShopResult<CreatedInvoice> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedInvoice {
            id: format!("{}-{n}", self.channel.as_str()),
            qr_png: vec![0x89, 0x50, 0x4e, 0x47],
        })
    }

    async fn is_paid(&self, _invoice_id: &str) -> ShopResult<bool> {
        Ok(self.paid.load(Ordering::SeqCst))
    }
}

/// Provisioning panel fake with switchable create/delete failure.
#[derive(Default)]
pub struct FakePanel {
    pub fail_create: AtomicBool,
    pub fail_delete: AtomicBool,
    pub calls: Mutex<Vec<String>>,
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
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ShopError::RemoteProvisioning("panel rejected".into()));
        }
        Ok(AccountMetadata {
            raw: serde_json::json!({ "host": "sg1.example.com", "port": 443 }),
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
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete:{username}"));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(ShopError::RemoteProvisioning("panel unreachable".into()));
        }
        Ok(())
    }
}
