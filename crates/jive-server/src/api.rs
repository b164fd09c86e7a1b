use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::Method, middleware, routing::get, Json, Router};
use jive_shared::constants::PROTOCOL_VERSION;
use jive_shared::UserId;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::engine::ChatEngine;
use crate::rate_limit::{rate_limit_middleware, Quota, RateLimiter};
use crate::socket;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub verifier: TokenVerifier,
    /// Per-IP limit on HTTP requests, handshakes included.
    pub rate_limiter: RateLimiter,
    /// Per-user limit on inbound socket events.
    pub event_limiter: RateLimiter<UserId>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>, config: ServerConfig) -> Self {
        Self {
            engine,
            verifier: TokenVerifier::new(&config.jwt_secret),
            rate_limiter: RateLimiter::default(),
            event_limiter: RateLimiter::new(Quota {
                per_second: config.event_rate,
                burst: config.event_burst,
            }),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(socket::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: &'static str,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    page_size: u32,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: "jive",
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        online_users: state.engine.presence().online_count().await,
        page_size: state.config.page_size,
    })
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
