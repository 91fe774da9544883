use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::store::{admin_message_key, admin_response_key, user_message_key, KvStore, LAST_USER_KEY};
use crate::telegram::types::Location;
use crate::telegram::{sent_message_id, Message, TelegramApi, Update, User};

const NOTICE_REPLY_TARGET_MISSING: &str = "Could not find the user to reply to.";
const NOTICE_NO_ACTIVE_USER: &str = "No recently active user session.";
const ADMIN_NON_TEXT_FALLBACK: &str = "Received a non-text message";
const USER_NON_TEXT_FALLBACK: &str = "User sent a non-text message";
const UNKNOWN_USER_LABEL: &str = "unknown user";

/// What a message carries, picked by first match in a fixed priority order.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent<'a> {
    Photo(&'a str),
    Sticker(&'a str),
    Voice(&'a str),
    Document(&'a str),
    Video(&'a str),
    Location { latitude: f64, longitude: f64 },
    Text(&'a str),
    Unknown,
}

impl<'a> MessageContent<'a> {
    /// Photo, sticker, voice, document, video, location, then text.
    pub fn classify(message: &'a Message) -> Self {
        if let Some(largest) = message.photo.as_ref().and_then(|sizes| sizes.last()) {
            return Self::Photo(&largest.file_id);
        }
        if let Some(sticker) = &message.sticker {
            return Self::Sticker(&sticker.file_id);
        }
        if let Some(voice) = &message.voice {
            return Self::Voice(&voice.file_id);
        }
        if let Some(document) = &message.document {
            return Self::Document(&document.file_id);
        }
        if let Some(video) = &message.video {
            return Self::Video(&video.file_id);
        }
        if let Some(Location { latitude, longitude }) = message.location {
            return Self::Location { latitude, longitude };
        }
        match message.text.as_deref() {
            Some(text) if !text.is_empty() => Self::Text(text),
            _ => Self::Unknown,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Photo(_) => "photo",
            Self::Sticker(_) => "sticker",
            Self::Voice(_) => "voice",
            Self::Document(_) => "document",
            Self::Video(_) => "video",
            Self::Location { .. } => "location",
            Self::Text(_) => "text",
            Self::Unknown => "unknown",
        }
    }
}

/// Who a message is being relayed from.
#[derive(Debug, Clone)]
enum Sender {
    Admin,
    User { label: String },
}

impl Sender {
    fn subject(&self) -> &'static str {
        match self {
            Sender::Admin => "Admin",
            Sender::User { .. } => "User",
        }
    }

    fn fallback_text(&self) -> &'static str {
        match self {
            Sender::Admin => ADMIN_NON_TEXT_FALLBACK,
            Sender::User { .. } => USER_NON_TEXT_FALLBACK,
        }
    }

    /// History entry describing what was relayed.
    fn describe(&self, content: &MessageContent<'_>) -> String {
        let who = self.subject();
        match content {
            MessageContent::Photo(id) => format!("{who} sent a photo: {id}"),
            MessageContent::Sticker(id) => format!("{who} sent a sticker: {id}"),
            MessageContent::Voice(id) => format!("{who} sent a voice message: {id}"),
            MessageContent::Document(id) => format!("{who} sent a document: {id}"),
            MessageContent::Video(id) => format!("{who} sent a video: {id}"),
            MessageContent::Location {
                latitude,
                longitude,
            } => format!("{who} sent a location: latitude {latitude}, longitude {longitude}"),
            MessageContent::Text(text) => text.to_string(),
            MessageContent::Unknown => self.fallback_text().to_string(),
        }
    }
}

/// Routes each inbound message to the opposite party and keeps the
/// key-value associations needed to route admin replies back.
pub struct Relay {
    api: Arc<dyn TelegramApi>,
    store: KvStore,
    admin_chat_id: i64,
}

impl Relay {
    pub fn new(api: Arc<dyn TelegramApi>, store: KvStore, admin_chat_id: i64) -> Self {
        Self {
            api,
            store,
            admin_chat_id,
        }
    }

    pub async fn handle_update(&self, update: Update) -> Result<()> {
        match update.message {
            Some(message) => self.handle_message(&message).await,
            None => {
                debug!("Ignoring update {} without a message", update.update_id);
                Ok(())
            }
        }
    }

    pub async fn handle_message(&self, message: &Message) -> Result<()> {
        if message.chat.id == self.admin_chat_id {
            self.relay_from_admin(message).await
        } else {
            self.relay_from_user(message).await
        }
    }

    async fn relay_from_admin(&self, message: &Message) -> Result<()> {
        let Some(target) = self.resolve_admin_target(message).await? else {
            return Ok(());
        };

        let content = MessageContent::classify(message);
        let sender = Sender::Admin;
        info!("Relaying admin {} to chat {}", content.kind(), target);

        self.forward(target, &content, &sender).await?;
        self.store
            .put(&admin_response_key(target), &sender.describe(&content))
            .await?;
        Ok(())
    }

    /// The replied-to mapping when the admin used "reply", otherwise the last
    /// active user. `None` after telling the admin nobody could be found.
    async fn resolve_admin_target(&self, message: &Message) -> Result<Option<i64>> {
        let (stored, notice) = match &message.reply_to_message {
            Some(replied) => (
                self.store.get(&admin_message_key(replied.message_id)).await?,
                NOTICE_REPLY_TARGET_MISSING,
            ),
            None => (self.store.get(LAST_USER_KEY).await?, NOTICE_NO_ACTIVE_USER),
        };

        match stored {
            Some(chat_id) => {
                let chat_id = chat_id
                    .trim()
                    .parse::<i64>()
                    .with_context(|| format!("Stored chat id is not numeric: {chat_id}"))?;
                Ok(Some(chat_id))
            }
            None => {
                warn!("No relay target for admin message {}: {}", message.message_id, notice);
                self.api.send_message(self.admin_chat_id, notice).await?;
                Ok(None)
            }
        }
    }

    async fn relay_from_user(&self, message: &Message) -> Result<()> {
        let chat_id = message.chat.id;
        let label = message
            .from
            .as_ref()
            .and_then(User::label)
            .unwrap_or_else(|| UNKNOWN_USER_LABEL.to_string());
        let content = MessageContent::classify(message);
        let sender = Sender::User { label };
        info!("Relaying {} from chat {} to admin", content.kind(), chat_id);

        let response = self.forward(self.admin_chat_id, &content, &sender).await?;

        if let Some(admin_message_id) = sent_message_id(&response) {
            self.store
                .put(&admin_message_key(admin_message_id), &chat_id.to_string())
                .await?;
        } else {
            debug!("Send to admin returned no message id: {}", response);
        }

        self.store
            .put(&user_message_key(chat_id), &sender.describe(&content))
            .await?;
        self.store.put(LAST_USER_KEY, &chat_id.to_string()).await?;
        Ok(())
    }

    /// Send `content` to `chat_id`. Messages from users carry an attribution
    /// on photos and text; admin messages are sent as-is.
    async fn forward(&self, chat_id: i64, content: &MessageContent<'_>, sender: &Sender) -> Result<Value> {
        let api = &self.api;
        match content {
            MessageContent::Photo(file_id) => {
                let caption = match sender {
                    Sender::User { label } => Some(format!("Photo from user {label}")),
                    Sender::Admin => None,
                };
                api.send_photo(chat_id, file_id, caption.as_deref()).await
            }
            MessageContent::Sticker(file_id) => api.send_sticker(chat_id, file_id).await,
            MessageContent::Voice(file_id) => api.send_voice(chat_id, file_id).await,
            MessageContent::Document(file_id) => api.send_document(chat_id, file_id).await,
            MessageContent::Video(file_id) => api.send_video(chat_id, file_id).await,
            MessageContent::Location {
                latitude,
                longitude,
            } => api.send_location(chat_id, *latitude, *longitude).await,
            MessageContent::Text(text) => self.send_text(chat_id, text, sender).await,
            MessageContent::Unknown => {
                self.send_text(chat_id, sender.fallback_text(), sender).await
            }
        }
    }

    async fn send_text(&self, chat_id: i64, text: &str, sender: &Sender) -> Result<Value> {
        let body = match sender {
            Sender::User { label } => format!("Message from user {label}:\n{text}"),
            Sender::Admin => text.to_string(),
        };
        self.api.send_message(chat_id, &body).await
    }
}
