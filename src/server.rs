use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::relay::Relay;
use crate::store::KvStore;
use crate::telegram::{is_ok, TelegramApi, Update};

/// Header Telegram uses to echo the secret given to `setWebhook`.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    api: Arc<dyn TelegramApi>,
    webhook_secret: Arc<str>,
    webhook_path: Arc<str>,
    /// Relay work still running after its webhook call was acknowledged.
    tasks: TaskTracker,
}

impl AppState {
    pub fn new(config: &Config, api: Arc<dyn TelegramApi>, store: KvStore) -> Self {
        let relay = Relay::new(api.clone(), store, config.telegram.admin_chat_id);
        Self {
            relay: Arc::new(relay),
            api,
            webhook_secret: config.telegram.webhook_secret.as_str().into(),
            webhook_path: config.server.webhook_path.as_str().into(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let webhook_path = state.webhook_path.to_string();
    Router::new()
        .route(&webhook_path, post(handle_webhook))
        .route(
            "/registerWebhook",
            get(register_webhook).post(register_webhook),
        )
        .route(
            "/unRegisterWebhook",
            get(unregister_webhook).post(unregister_webhook),
        )
        .fallback(no_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C or SIGTERM, then wait for in-flight relay tasks.
pub async fn serve(listen_addr: &str, state: AppState) -> Result<()> {
    let tasks = state.tasks();
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;

    info!("Listening on {}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tasks.close();
    if !tasks.is_empty() {
        info!("Waiting for {} relay task(s) to finish", tasks.len());
    }
    tasks.wait().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn handle_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let provided = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !constant_time_eq(provided, &state.webhook_secret) {
        warn!("Rejected webhook call with missing or wrong secret");
        return (StatusCode::FORBIDDEN, "Unauthorized").into_response();
    }

    // Anything but a 2xx makes Telegram redeliver, so unreadable bodies are acked too.
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("Webhook body is not JSON, dropping it: {}", e);
            return "Ok".into_response();
        }
    };

    // Telegram only needs a fast 2xx; relay failures are logged, not returned.
    match serde_json::from_value::<Update>(payload) {
        Ok(update) if update.message.is_some() => {
            let relay = state.relay.clone();
            let update_id = update.update_id;
            state.tasks.spawn(async move {
                if let Err(e) = relay.handle_update(update).await {
                    error!("Failed to relay update {}: {:#}", update_id, e);
                }
            });
        }
        Ok(update) => debug!("Update {} has no message, ignoring", update.update_id),
        Err(e) => warn!("Ignoring malformed update: {}", e),
    }

    "Ok".into_response()
}

async fn register_webhook(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let Some(url) = callback_url(&headers, &uri, &state.webhook_path) else {
        return (StatusCode::BAD_REQUEST, "Cannot determine public host").into_response();
    };

    info!("Registering webhook at {}", url);
    let result = state.api.set_webhook(&url, Some(&*state.webhook_secret)).await;
    provider_reply("setWebhook", result)
}

async fn unregister_webhook(State(state): State<AppState>) -> Response {
    info!("Removing webhook");
    let result = state.api.set_webhook("", None).await;
    provider_reply("setWebhook", result)
}

async fn no_handler() -> &'static str {
    "No handler for this request"
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// `Ok` when Telegram agreed, otherwise its reply verbatim.
fn provider_reply(method: &str, result: Result<Value>) -> Response {
    match result {
        Ok(reply) if is_ok(&reply) => "Ok".into_response(),
        Ok(reply) => {
            warn!("{} was refused: {}", method, reply);
            serde_json::to_string_pretty(&reply)
                .unwrap_or_else(|_| reply.to_string())
                .into_response()
        }
        Err(e) => {
            error!("{} failed: {:#}", method, e);
            (StatusCode::BAD_GATEWAY, format!("{e:#}")).into_response()
        }
    }
}

/// Public URL of the webhook, derived from how this request reached us.
fn callback_url(headers: &HeaderMap, uri: &Uri, webhook_path: &str) -> Option<String> {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let scheme = header_value("x-forwarded-proto")
        .or_else(|| uri.scheme_str())
        .unwrap_or("https");

    let host = header_value("x-forwarded-host")
        .or_else(|| header_value(header::HOST.as_str()))
        .or_else(|| uri.host())
        .map(strip_port)
        .filter(|h| !h.is_empty())?;

    Some(format!("{scheme}://{host}{webhook_path}"))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal, keep the brackets
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, StoreConfig, TelegramConfig};
    use crate::store::LAST_USER_KEY;
    use crate::telegram::testing::RecordingApi;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret";
    const ADMIN: i64 = 42;

    fn test_config() -> Config {
        Config {
            telegram: TelegramConfig {
                bot_token: "123:abc".to_string(),
                webhook_secret: SECRET.to_string(),
                admin_chat_id: ADMIN,
                api_base_url: "https://api.telegram.org".to_string(),
            },
            server: ServerConfig {
                listen_addr: "127.0.0.1:0".to_string(),
                webhook_path: "/endpoint".to_string(),
            },
            store: StoreConfig {
                database_path: ":memory:".into(),
            },
        }
    }

    fn setup() -> (AppState, Arc<RecordingApi>, KvStore) {
        let api = Arc::new(RecordingApi::new());
        let store = KvStore::open_in_memory().unwrap();
        let state = AppState::new(&test_config(), api.clone(), store.clone());
        (state, api, store)
    }

    fn user_update(chat_id: i64, text: &str) -> String {
        json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": { "id": chat_id, "type": "private" },
                "from": { "id": chat_id, "first_name": "Alex" },
                "text": text
            }
        })
        .to_string()
    }

    fn webhook_request(secret: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/endpoint");
        if let Some(secret) = secret {
            builder = builder.header("X-Telegram-Bot-Api-Secret-Token", secret);
        }
        builder
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn drain(state: &AppState) {
        let tasks = state.tasks();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_secret() {
        for secret in [None, Some("wrong"), Some("")] {
            let (state, api, store) = setup();
            let response = router(state.clone())
                .oneshot(webhook_request(secret, user_update(555, "hello")))
                .await
                .unwrap();
            drain(&state).await;

            assert_eq!(response.status(), StatusCode::FORBIDDEN);
            assert!(api.calls().is_empty());
            assert_eq!(store.get(LAST_USER_KEY).await.unwrap(), None);
            assert_eq!(store.count_prefix("").await.unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_webhook_relays_in_background() {
        let (state, api, store) = setup();
        let response = router(state.clone())
            .oneshot(webhook_request(Some(SECRET), user_update(555, "hello")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Ok");

        drain(&state).await;
        assert_eq!(store.get(LAST_USER_KEY).await.unwrap().as_deref(), Some("555"));
        let call = api.last_call();
        assert_eq!(call.chat_id(), Some(ADMIN));
        assert!(call.body["text"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_webhook_acks_even_when_relay_fails() {
        let (state, api, _store) = setup();
        // Admin with no active user: relay stops after the notice; still acknowledged.
        let body = json!({
            "update_id": 2,
            "message": { "message_id": 3, "chat": { "id": ADMIN }, "text": "hi" }
        })
        .to_string();
        let response = router(state.clone())
            .oneshot(webhook_request(Some(SECRET), body))
            .await
            .unwrap();
        drain(&state).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_ignores_non_message_updates() {
        let (state, api, _store) = setup();
        let body = json!({ "update_id": 3, "edited_message": { "message_id": 1 } }).to_string();
        let response = router(state.clone())
            .oneshot(webhook_request(Some(SECRET), body))
            .await
            .unwrap();
        drain(&state).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_acks_invalid_json() {
        let (state, api, store) = setup();
        let response = router(state.clone())
            .oneshot(webhook_request(Some(SECRET), "not json".to_string()))
            .await
            .unwrap();
        drain(&state).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Ok");
        assert!(api.calls().is_empty());
        assert_eq!(store.count_prefix("").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_custom_webhook_path() {
        let mut config = test_config();
        config.server.webhook_path = "/telegram/hook".to_string();
        let api = Arc::new(RecordingApi::new());
        let store = KvStore::open_in_memory().unwrap();
        let state = AppState::new(&config, api.clone(), store.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/telegram/hook")
            .header("X-Telegram-Bot-Api-Secret-Token", SECRET)
            .body(Body::from(user_update(555, "hello")))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        drain(&state).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(store.get(LAST_USER_KEY).await.unwrap().as_deref(), Some("555"));
    }

    #[tokio::test]
    async fn test_register_webhook_uses_request_host() {
        let (state, api, _store) = setup();
        api.reply_with(json!({ "ok": true, "result": true, "description": "Webhook was set" }));
        let request = Request::builder()
            .uri("/registerWebhook")
            .header("host", "example.com")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        assert_eq!(body_text(response).await, "Ok");
        let call = api.last_call();
        assert_eq!(call.method, "setWebhook");
        assert_eq!(
            call.body,
            json!({ "url": "https://example.com/endpoint", "secret_token": SECRET })
        );
    }

    #[tokio::test]
    async fn test_register_webhook_reports_refusal() {
        let (state, api, _store) = setup();
        api.reply_with(json!({ "ok": false, "error_code": 400, "description": "bad webhook" }));
        let request = Request::builder()
            .method("POST")
            .uri("/registerWebhook")
            .header("host", "example.com:8443")
            .header("x-forwarded-proto", "http")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        let text = body_text(response).await;
        assert!(text.contains("bad webhook"));
        assert_eq!(api.last_call().body["url"], "http://example.com/endpoint");
    }

    #[tokio::test]
    async fn test_unregister_webhook() {
        let (state, api, _store) = setup();
        api.reply_with(json!({ "ok": true, "result": true }));
        let request = Request::builder()
            .uri("/unRegisterWebhook")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        assert_eq!(body_text(response).await, "Ok");
        assert_eq!(api.last_call().body, json!({ "url": "" }));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let (state, api, _store) = setup();
        let request = Request::builder()
            .uri("/whatever")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "No handler for this request");
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_callback_url_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "internal:8080".parse().unwrap());
        headers.insert("x-forwarded-host", "bot.example.org".parse().unwrap());
        headers.insert("x-forwarded-proto", "https, http".parse().unwrap());
        let uri: Uri = "/registerWebhook".parse().unwrap();

        assert_eq!(
            callback_url(&headers, &uri, "/endpoint").as_deref(),
            Some("https://bot.example.org/endpoint")
        );
    }

    #[test]
    fn test_callback_url_without_host() {
        let uri: Uri = "/registerWebhook".parse().unwrap();
        assert_eq!(callback_url(&HeaderMap::new(), &uri, "/endpoint"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("s3cret", "s3cret"));
        assert!(!constant_time_eq("s3cret", "s3creT"));
        assert!(!constant_time_eq("s3cret", "s3cret2"));
        assert!(!constant_time_eq("", "s3cret"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:8443"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
    }
}
