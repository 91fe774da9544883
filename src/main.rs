mod config;
mod relay;
mod server;
mod store;
mod telegram;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::server::AppState;
use crate::store::KvStore;
use crate::telegram::BotApi;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Config file is optional: first argument, RELAYBOT_CONFIG, or ./config.toml if present
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RELAYBOT_CONFIG").ok())
        .map(PathBuf::from)
        .or_else(|| Some(PathBuf::from("config.toml")).filter(|p| p.exists()));

    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("Loading configuration from environment"),
    }
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Admin chat: {}", config.telegram.admin_chat_id);
    info!("  Webhook path: {}", config.server.webhook_path);
    info!("  Database: {}", config.store.database_path.display());

    let store = KvStore::open(&config.store.database_path)?;
    let pending = store.admin_message_count().await?;
    info!("  Reply mappings stored: {}", pending);

    let api = Arc::new(BotApi::new(&config.telegram));
    let state = AppState::new(&config, api, store);

    info!("Relay bot is starting...");
    server::serve(&config.server.listen_addr, state).await?;

    Ok(())
}
