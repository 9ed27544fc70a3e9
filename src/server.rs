use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use futures::FutureExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::BotIdentity;
use crate::dispatcher::Dispatcher;
use crate::telegram::TelegramApi;
use crate::update::InboundEvent;

pub const HEALTH_TEXT: &str = "🤖 Bots de réactions actifs !";

/// Shared state for the webhook routes
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    /// Path segment (`webhook<bot id>`) to the bot that owns it.
    bots: Arc<HashMap<String, Arc<BotIdentity>>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, bots: &[BotIdentity]) -> Self {
        let bots = bots
            .iter()
            .map(|bot| {
                let segment = bot.webhook_path().trim_start_matches('/').to_string();
                (segment, Arc::new(bot.clone()))
            })
            .collect();
        Self {
            dispatcher,
            bots: Arc::new(bots),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/{hook}", post(handle_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    HEALTH_TEXT
}

async fn handle_update(
    State(state): State<AppState>,
    Path(hook): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some(bot) = state.bots.get(&hook).cloned() else {
        warn!("Update posted to unknown webhook path /{}", hook);
        return StatusCode::NOT_FOUND;
    };

    let event = match InboundEvent::from_json(&body) {
        Ok(event) => event,
        Err(e) => {
            error!("@{}: failed to decode update: {}", bot.username, e);
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    debug!("@{}: received {:?}", bot.username, event);

    let handled = AssertUnwindSafe(state.dispatcher.dispatch(&bot, &event))
        .catch_unwind()
        .await;
    match handled {
        Ok(()) => StatusCode::OK,
        Err(_) => {
            error!("@{}: update handler panicked", bot.username);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Point every bot's webhook at this server. Failures are logged and do not
/// stop startup.
pub async fn register_webhooks(api: &dyn TelegramApi, bots: &[BotIdentity]) {
    let registrations = bots.iter().map(|bot| async move {
        let url = bot.webhook_endpoint();
        match api.set_webhook(&bot.token, &url, true).await {
            Ok(()) => info!("Webhook for @{} set to {}", bot.username, url),
            Err(e) => error!("Failed to set webhook for @{}: {:#}", bot.username, e),
        }
    });
    futures::future::join_all(registrations).await;
}

pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("HTTP server error")
}
