use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::TelegramConfig;

/// Bot API methods used by the relay. Each helper maps one-to-one onto a
/// Telegram method and hands back the raw JSON reply without checking `ok`.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    /// POST `body` to `method` and return the parsed response body.
    async fn call(&self, method: &str, body: Value) -> Result<Value>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<Value> {
        self.call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await
    }

    async fn send_photo(&self, chat_id: i64, file_id: &str, caption: Option<&str>) -> Result<Value> {
        let mut body = json!({ "chat_id": chat_id, "photo": file_id });
        if let Some(caption) = caption {
            body["caption"] = Value::from(caption);
        }
        self.call("sendPhoto", body).await
    }

    async fn send_sticker(&self, chat_id: i64, file_id: &str) -> Result<Value> {
        self.call("sendSticker", json!({ "chat_id": chat_id, "sticker": file_id }))
            .await
    }

    async fn send_voice(&self, chat_id: i64, file_id: &str) -> Result<Value> {
        self.call("sendVoice", json!({ "chat_id": chat_id, "voice": file_id }))
            .await
    }

    async fn send_document(&self, chat_id: i64, file_id: &str) -> Result<Value> {
        self.call("sendDocument", json!({ "chat_id": chat_id, "document": file_id }))
            .await
    }

    async fn send_video(&self, chat_id: i64, file_id: &str) -> Result<Value> {
        self.call("sendVideo", json!({ "chat_id": chat_id, "video": file_id }))
            .await
    }

    async fn send_location(&self, chat_id: i64, latitude: f64, longitude: f64) -> Result<Value> {
        self.call(
            "sendLocation",
            json!({ "chat_id": chat_id, "latitude": latitude, "longitude": longitude }),
        )
        .await
    }

    /// Point Telegram at `url`; an empty url removes the webhook.
    async fn set_webhook(&self, url: &str, secret_token: Option<&str>) -> Result<Value> {
        let mut body = json!({ "url": url });
        if let Some(secret) = secret_token {
            body["secret_token"] = Value::from(secret);
        }
        self.call("setWebhook", body).await
    }
}

/// `result.message_id` of a send reply, if the reply carries one.
pub fn sent_message_id(response: &Value) -> Option<i64> {
    response
        .get("result")
        .and_then(|r| r.get("message_id"))
        .and_then(Value::as_i64)
}

/// Whether the reply reports `"ok": true`.
pub fn is_ok(response: &Value) -> bool {
    response.get("ok").and_then(Value::as_bool) == Some(true)
}

/// reqwest-backed client for `https://api.telegram.org/bot<token>/<method>`.
pub struct BotApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl BotApi {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.api_base_url.clone(),
            token: config.bot_token.clone(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }
}

#[async_trait]
impl TelegramApi for BotApi {
    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to send {method} request to Telegram"))?;

        let status = response.status();
        debug!("Telegram {} responded with {}", method, status);

        // Error replies are JSON too; the caller decides what to read from them.
        response
            .json::<Value>()
            .await
            .with_context(|| format!("Failed to parse {method} response ({status})"))
    }
}
