//! Configuration loaded with Figment.
//!
//! Merge order (later overrides earlier): built-in defaults, the optional TOML
//! file, then `RELAYBOT_*` environment variables.

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "RELAYBOT_";

/// Paths the server already routes; the webhook may not shadow them.
const RESERVED_PATHS: [&str; 2] = ["/registerWebhook", "/unRegisterWebhook"];

#[derive(Clone, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub store: StoreConfig,
}

#[derive(Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Shared secret Telegram echoes back in `X-Telegram-Bot-Api-Secret-Token`.
    pub webhook_secret: String,
    /// The single chat allowed to reply through the bot.
    pub admin_chat_id: i64,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            webhook_path: default_webhook_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub database_path: PathBuf,
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_webhook_path() -> String {
    "/endpoint".to_string()
}

/// Map a prefix-stripped env var name onto its dotted config key, e.g.
/// `BOT_TOKEN` -> `telegram.bot_token`. Explicit because keys contain `_`.
fn env_key(key: &str) -> String {
    match key {
        "bot_token" | "webhook_secret" | "admin_chat_id" | "api_base_url" => {
            format!("telegram.{key}")
        }
        "listen_addr" | "webhook_path" => format!("server.{key}"),
        "database_path" => format!("store.{key}"),
        other => other.to_string(),
    }
}

fn env_provider() -> Env {
    Env::prefixed(ENV_PREFIX).map(|key| env_key(&key.as_str().to_ascii_lowercase()).into())
}

impl Config {
    /// Load from an optional TOML file, then apply `RELAYBOT_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }
        Self::from_figment(figment.merge(env_provider()))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: Config = figment.extract().context("Invalid configuration")?;
        config.telegram.api_base_url = config
            .telegram
            .api_base_url
            .trim_end_matches('/')
            .to_string();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token must not be empty");
        }
        if self.telegram.webhook_secret.trim().is_empty() {
            bail!("telegram.webhook_secret must not be empty");
        }
        if self.store.database_path.as_os_str().is_empty() {
            bail!("store.database_path must not be empty");
        }
        validate_webhook_path(&self.server.webhook_path)
    }
}

/// The webhook path becomes a literal axum route next to the registration routes.
fn validate_webhook_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!("webhook_path must start with '/', got: {path}");
    }
    if RESERVED_PATHS.contains(&path) {
        bail!("webhook_path {path} is already used by webhook registration");
    }
    if path.contains(['{', '}']) {
        bail!("webhook_path must not contain '{{' or '}}', got: {path}");
    }
    if path
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
    {
        bail!("webhook_path segments must not start with ':' or '*', got: {path}");
    }
    Ok(())
}
