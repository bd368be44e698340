use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use super::{ChatTransport, Keyboard};

#[derive(Clone)]
pub struct TelegramTransport {
    client: Client,
    bot_token: String,
    api_base: String,
}

impl TelegramTransport {
    pub fn new(bot_token: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            api_base: "https://api.telegram.org".to_string(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let err_text = resp.text().await?;
            error!("Telegram {} error: {}", method, err_text);
            anyhow::bail!("Telegram {} failed: {}", method, err_text);
        }
        let json: Value = resp.json().await?;
        Ok(json["result"].clone())
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout: u64) -> Result<Vec<TgUpdate>> {
        let mut body = json!({ "timeout": timeout });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        let result = self.call("getUpdates", body).await?;
        let updates: Vec<TgUpdate> = serde_json::from_value(result)?;
        Ok(updates)
    }

    fn keyboard_markup(keyboard: Keyboard) -> Value {
        let rows: Vec<Vec<Value>> = keyboard
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|b| json!({ "text": b.text, "callback_data": b.data }))
                    .collect()
            })
            .collect();
        json!({ "inline_keyboard": rows })
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<i64> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(kb) = keyboard {
            body["reply_markup"] = Self::keyboard_markup(kb);
        }
        let result = self.call("sendMessage", body).await?;
        Ok(result["message_id"].as_i64().unwrap_or_default())
    }

    async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<()> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = Self::keyboard_markup(kb);
        }
        self.call("editMessageText", body).await?;
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.call(
            "deleteMessage",
            json!({ "chat_id": chat_id, "message_id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        png: Vec<u8>,
        caption: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<i64> {
        let part = reqwest::multipart::Part::bytes(png)
            .file_name("qr.png")
            .mime_str("image/png")?;
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", part);
        if let Some(kb) = keyboard {
            form = form.text("reply_markup", Self::keyboard_markup(kb).to_string());
        }

        let resp = self
            .client
            .post(self.method_url("sendPhoto"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            let err_text = resp.text().await?;
            error!("Telegram sendPhoto error: {}", err_text);
            anyhow::bail!("Telegram sendPhoto failed: {}", err_text);
        }
        let json: Value = resp.json().await?;
        Ok(json["result"]["message_id"].as_i64().unwrap_or_default())
    }

    async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(text);
            body["show_alert"] = json!(true);
        }
        self.call("answerCallbackQuery", body).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub callback_query: Option<TgCallback>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TgUser>,
    pub chat: TgChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallback {
    pub id: String,
    pub from: TgUser,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_payload_parses() {
        let raw = r#"
        [
            {
                "update_id": 7,
                "message": {
                    "message_id": 100,
                    "from": { "id": 42, "username": "alice" },
                    "chat": { "id": 42, "type": "private" },
                    "text": "/start"
                }
            },
            {
                "update_id": 8,
                "callback_query": {
                    "id": "cb1",
                    "from": { "id": 42, "username": "alice" },
                    "message": {
                        "message_id": 101,
                        "chat": { "id": 42, "type": "private" }
                    },
                    "data": "menu"
                }
            }
        ]
        "#;
        let updates: Vec<TgUpdate> = serde_json::from_str(raw).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].message.as_ref().unwrap().text.as_deref(), Some("/start"));
        assert_eq!(updates[1].callback_query.as_ref().unwrap().data.as_deref(), Some("menu"));
    }
}
