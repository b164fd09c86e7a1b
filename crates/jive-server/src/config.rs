//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use jive_shared::constants::{
    DEFAULT_GROUP_IMAGE, DEFAULT_HTTP_PORT, DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_LIMIT,
    DEFAULT_SURROUNDING_RANGE,
};

/// Secret used when `JWT_SECRET` is unset. Development only.
const DEV_JWT_SECRET: &str = "jive-dev-secret-change-me";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./jive.db`
    pub database_path: PathBuf,

    /// HS256 secret used to verify handshake tokens.
    /// Env: `JWT_SECRET`
    pub jwt_secret: String,

    /// Messages per history page.
    /// Env: `PAGE_SIZE`
    pub page_size: u32,

    /// Maximum search hits.
    /// Env: `SEARCH_LIMIT`
    pub search_limit: u32,

    /// Messages on each side of a surrounding-window fetch.
    /// Env: `SURROUNDING_RANGE`
    pub surrounding_range: u32,

    /// Avatar for new groups.
    /// Env: `DEFAULT_GROUP_IMAGE`
    pub default_group_image: String,

    // -- Inbound socket throttling (per user) --

    /// Env: `EVENT_RATE` (events per second)
    pub event_rate: f64,

    /// Env: `EVENT_BURST`
    pub event_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./jive.db"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            search_limit: DEFAULT_SEARCH_LIMIT,
            surrounding_range: DEFAULT_SURROUNDING_RANGE,
            default_group_image: DEFAULT_GROUP_IMAGE.to_string(),
            event_rate: 20.0,
            event_burst: 60.0,
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"<redacted>")
            .field("page_size", &self.page_size)
            .field("search_limit", &self.search_limit)
            .field("surrounding_range", &self.surrounding_range)
            .field("default_group_image", &self.default_group_image)
            .field("event_rate", &self.event_rate)
            .field("event_burst", &self.event_burst)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok();

        let mut config = Self {
            http_addr: parse_or("HTTP_ADDR", var("HTTP_ADDR"), defaults.http_addr),
            page_size: parse_or("PAGE_SIZE", var("PAGE_SIZE"), defaults.page_size),
            search_limit: parse_or("SEARCH_LIMIT", var("SEARCH_LIMIT"), defaults.search_limit),
            surrounding_range: parse_or(
                "SURROUNDING_RANGE",
                var("SURROUNDING_RANGE"),
                defaults.surrounding_range,
            ),
            event_rate: parse_or("EVENT_RATE", var("EVENT_RATE"), defaults.event_rate),
            event_burst: parse_or("EVENT_BURST", var("EVENT_BURST"), defaults.event_burst),
            ..defaults
        };

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        match var("JWT_SECRET").filter(|s| !s.is_empty()) {
            Some(secret) => config.jwt_secret = secret,
            None => tracing::warn!("JWT_SECRET not set, using the development secret"),
        }

        if let Some(url) = var("DEFAULT_GROUP_IMAGE").filter(|s| !s.is_empty()) {
            config.default_group_image = url;
        }

        if config.page_size == 0 {
            tracing::warn!("PAGE_SIZE must be positive, using default");
            config.page_size = DEFAULT_PAGE_SIZE;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse `raw` if present, warning and falling back to `default` otherwise.
fn parse_or<T: FromStr>(name: &str, raw: Option<String>, default: T) -> T {
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            default
        }
    }
}
