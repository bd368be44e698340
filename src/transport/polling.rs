use tokio::sync::mpsc::Sender;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::telegram::{TelegramTransport, TgCallback, TgMessage};
use super::ChatEvent;

/// Long-polling loop feeding inbound updates into the event channel.
pub struct PollingService {
    client: TelegramTransport,
    tx: Sender<ChatEvent>,
    poll_timeout: u64,
}

impl PollingService {
    pub fn new(client: TelegramTransport, tx: Sender<ChatEvent>, poll_timeout: u64) -> Self {
        Self {
            client,
            tx,
            poll_timeout,
        }
    }

    pub async fn run(&self) {
        info!("starting chat long-polling service");

        let mut offset: Option<i64> = None;
        let mut backoff_secs = 1;

        loop {
            match self.client.get_updates(offset, self.poll_timeout).await {
                Ok(updates) => {
                    backoff_secs = 1;

                    for update in updates {
                        offset = Some(update.update_id + 1);

                        let event = if let Some(message) = update.message {
                            event_from_message(message)
                        } else if let Some(callback) = update.callback_query {
                            event_from_callback(callback)
                        } else {
                            None
                        };

                        if let Some(event) = event {
                            if self.tx.send(event).await.is_err() {
                                warn!("event channel closed, stopping polling");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("polling error: {}. retrying in {}s", e, backoff_secs);
                    sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(60);
                }
            }
        }
    }
}

fn event_from_message(message: TgMessage) -> Option<ChatEvent> {
    // group chatter is ignored: the storefront is a private-chat surface
    if message.chat.kind != "private" {
        debug!("ignoring non-private message in chat {}", message.chat.id);
        return None;
    }
    let from = message.from?;
    let text = message.text?;
    Some(ChatEvent::Text {
        user_id: from.id.to_string(),
        username: from.username.unwrap_or_else(|| format!("user{}", from.id)),
        chat_id: message.chat.id,
        message_id: message.message_id,
        text,
    })
}

fn event_from_callback(callback: TgCallback) -> Option<ChatEvent> {
    let message = callback.message?;
    let data = callback.data?;
    Some(ChatEvent::Callback {
        user_id: callback.from.id.to_string(),
        username: callback
            .from
            .username
            .unwrap_or_else(|| format!("user{}", callback.from.id)),
        chat_id: message.chat.id,
        message_id: message.message_id,
        callback_id: callback.id,
        data,
    })
}
