//! # jive-server
//!
//! Real-time chat server for Jive.
//!
//! This binary provides:
//! - **WebSocket event protocol** for direct and group conversations,
//!   authenticated with HS256 bearer tokens at the handshake
//! - **Single-flight message ingestion** so that a burst of messages for a
//!   conversation that does not exist yet creates exactly one conversation
//! - **Presence, read markers, typing indicators, history pages and search**
//! - **REST endpoints** (axum) for health checks and server info
//! - **Per-IP and per-user rate limiting**

mod api;
mod auth;
mod config;
mod engine;
mod error;
mod images;
mod presence;
mod rate_limit;
mod socket;

use std::sync::Arc;
use std::time::Duration;

use jive_store::Database;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::engine::{ChatEngine, EngineSettings};
use crate::images::StoreImageStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    dotenvy::dotenv().ok();

    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,jive_server=debug")),
        )
        .init();

    info!("Starting Jive chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));
    let images = Arc::new(StoreImageStorage::new(db.clone()));
    let engine = Arc::new(ChatEngine::new(db, images, EngineSettings::from(&config)));

    let http_addr = config.http_addr;
    let app_state = AppState::new(engine, config);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_limiter = app_state.rate_limiter.clone();
    let event_limiter = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let max_idle = Duration::from_secs(600);
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_stale(max_idle).await;
            event_limiter.purge_stale(max_idle).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP / WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
