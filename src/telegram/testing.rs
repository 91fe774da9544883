//! In-process stand-in for the Bot API used by unit tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::TelegramApi;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub body: Value,
}

impl RecordedCall {
    pub fn chat_id(&self) -> Option<i64> {
        self.body.get("chat_id").and_then(Value::as_i64)
    }
}

/// Records every call. Replies like a successful send, numbering the
/// created messages from 1000, unless a fixed reply has been set.
pub struct RecordingApi {
    calls: Mutex<Vec<RecordedCall>>,
    next_message_id: AtomicI64,
    fixed_reply: Mutex<Option<Value>>,
}

impl RecordingApi {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(1000),
            fixed_reply: Mutex::new(None),
        }
    }

    pub fn reply_with(&self, reply: Value) {
        *self.fixed_reply.lock().unwrap() = Some(reply);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last_call(&self) -> RecordedCall {
        self.calls().pop().expect("no calls recorded")
    }
}

#[async_trait]
impl TelegramApi for RecordingApi {
    async fn call(&self, method: &str, body: Value) -> Result<Value> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.to_string(),
            body,
        });
        if let Some(reply) = self.fixed_reply.lock().unwrap().clone() {
            return Ok(reply);
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true, "result": { "message_id": id } }))
    }
}
