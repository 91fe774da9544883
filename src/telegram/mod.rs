pub mod api;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use api::{is_ok, sent_message_id, BotApi, TelegramApi};
pub use types::{Message, Update, User};
