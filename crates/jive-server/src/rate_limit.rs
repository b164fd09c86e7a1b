//! Token-bucket throttling: HTTP requests per client address, and inbound
//! socket events per user.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Sustained rate and burst size of one key's bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub per_second: f64,
    pub burst: f64,
}

impl Quota {
    /// REST calls and socket handshakes from one address.
    pub const HTTP: Quota = Quota {
        per_second: 10.0,
        burst: 30.0,
    };
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    remaining: f64,
    refreshed_at: Instant,
}

impl Allowance {
    fn full(quota: Quota, now: Instant) -> Self {
        Self {
            remaining: quota.burst,
            refreshed_at: now,
        }
    }

    /// Credit the time since the last refresh, then spend one unit.
    fn spend(&mut self, quota: Quota, now: Instant) -> bool {
        let earned = self.idle_for(now).as_secs_f64() * quota.per_second;
        self.remaining = (self.remaining + earned).min(quota.burst);
        self.refreshed_at = now;

        if self.remaining < 1.0 {
            return false;
        }
        self.remaining -= 1.0;
        true
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.refreshed_at)
    }
}

/// Allowances keyed by client address (the default) or user id. Clones
/// share one table.
#[derive(Clone)]
pub struct RateLimiter<K = IpAddr> {
    allowances: Arc<Mutex<HashMap<K, Allowance>>>,
    quota: Quota,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(quota: Quota) -> Self {
        Self {
            allowances: Arc::new(Mutex::new(HashMap::new())),
            quota,
        }
    }

    /// Spend one unit of `key`'s allowance. `false` means throttled.
    pub async fn check(&self, key: K) -> bool {
        self.check_at(key, Instant::now()).await
    }

    async fn check_at(&self, key: K, now: Instant) -> bool {
        let quota = self.quota;
        let mut allowances = self.allowances.lock().await;
        allowances
            .entry(key)
            .or_insert_with(|| Allowance::full(quota, now))
            .spend(quota, now)
    }

    /// Forget keys unseen for `max_idle`. A forgotten key comes back with
    /// a full burst.
    pub async fn purge_stale(&self, max_idle: Duration) {
        self.purge_at(max_idle, Instant::now()).await;
    }

    async fn purge_at(&self, max_idle: Duration, now: Instant) {
        let mut allowances = self.allowances.lock().await;
        let before = allowances.len();
        allowances.retain(|_, allowance| allowance.idle_for(now) < max_idle);
        debug!(purged = before - allowances.len(), tracked = allowances.len(), "rate limiter purge");
    }
}

impl Default for RateLimiter<IpAddr> {
    fn default() -> Self {
        Self::new(Quota::HTTP)
    }
}

/// Answers `429` once an address exceeds its quota. Requests whose address
/// cannot be determined are let through.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    match client_ip(&req) {
        Some(ip) if !limiter.check(ip).await => {
            warn!(%ip, path = %req.uri().path(), "request throttled");
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
        Some(_) => Ok(next.run(req).await),
        None => {
            debug!(path = %req.uri().path(), "client address unknown, not throttled");
            Ok(next.run(req).await)
        }
    }
}

/// The socket peer, or behind a reverse proxy the address it recorded.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip())
        .or_else(|| proxied_ip(req.headers()))
}

fn proxied_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    let parse = |value: &str| value.trim().parse::<IpAddr>().ok();

    // First hop of X-Forwarded-For is the original client.
    header("x-forwarded-for")
        .and_then(|chain| chain.split(',').next())
        .and_then(parse)
        .or_else(|| header("x-real-ip").and_then(parse))
}
