mod config;
mod dispatcher;
mod server;
mod telegram;
mod update;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::server::AppState;
use crate::telegram::{TelegramApi, TeloxideApi};

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry RUST_LOG, so load it before the subscriber
    let dotenv = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reactbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Ok(path) = dotenv {
        info!("Loaded environment from {}", path.display());
    }

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Port: {}", config.server.port);
    info!("  Reactions: {}", config.reactions.emojis.join(" "));
    for bot in &config.bots {
        info!("  Bot: @{} -> {}", bot.username, bot.webhook_path());
    }

    let api: Arc<dyn TelegramApi> = Arc::new(TeloxideApi::new(&config.server.api_base)?);
    let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&api)));
    let state = AppState::new(Arc::clone(&dispatcher), &config.bots);

    // Bind before registering so Telegram's first delivery finds us listening
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    let server_task = tokio::spawn(server::serve(listener, state));
    server::register_webhooks(api.as_ref(), &config.bots).await;

    let served = server_task.await.context("Server task failed")?;

    // Let already scheduled reactions land before exiting
    dispatcher.shutdown().await;
    info!("Shutdown complete");
    served
}
