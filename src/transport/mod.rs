pub mod polling;
pub mod telegram;

pub use telegram::TelegramTransport;

use anyhow::Result;
use async_trait::async_trait;

/// One inline button. `data` round-trips through the transport back to us as
/// a callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: String,
    pub data: String,
}

impl Button {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

pub type Keyboard = Vec<Vec<Button>>;

/// Inbound chat events, already reduced to the two shapes the core consumes.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Text {
        user_id: String,
        username: String,
        chat_id: i64,
        message_id: i64,
        text: String,
    },
    Callback {
        user_id: String,
        username: String,
        chat_id: i64,
        message_id: i64,
        callback_id: String,
        data: String,
    },
}

impl ChatEvent {
    pub fn user_id(&self) -> &str {
        match self {
            ChatEvent::Text { user_id, .. } | ChatEvent::Callback { user_id, .. } => user_id,
        }
    }

    pub fn chat_id(&self) -> i64 {
        match self {
            ChatEvent::Text { chat_id, .. } | ChatEvent::Callback { chat_id, .. } => *chat_id,
        }
    }
}

/// Outbound side of the chat boundary. The core issues effects through this
/// interface but does not own the transport, so everything above it is
/// testable with a recording fake.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a message; returns the new message id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<i64>;

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    /// Send a PNG with caption; returns the new message id.
    async fn send_photo(
        &self,
        chat_id: i64,
        png: Vec<u8>,
        caption: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<i64>;

    /// Acknowledge a button press, optionally with an alert text.
    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()>;
}
