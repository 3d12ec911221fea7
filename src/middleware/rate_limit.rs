//! Enrollment rate limiting.
//!
//! Sliding-window in-memory limiter keyed by client IP, applied only to the
//! enrollment endpoint: 10 attempts per 15 minutes per address.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(15 * 60),
        }
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

#[derive(Clone)]
pub struct EnrollRateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, WindowEntry>>>,
}

impl EnrollRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the seconds until the window resets when the IP is over its
    /// budget, `None` when the request is allowed.
    fn check(&self, ip: IpAddr) -> Option<u64> {
        let mut state = self.state.lock();
        let now = Instant::now();

        if state.len() > 1024 {
            let window = self.config.window;
            state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
        }

        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;

        if entry.count > self.config.max_requests {
            let reset_at = entry.window_start + self.config.window;
            Some(reset_at.duration_since(now).as_secs())
        } else {
            None
        }
    }

    /// Drop windows that expired; called opportunistically.
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;
        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

pub async fn enroll_rate_limit(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<EnrollRateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();
    match limiter.check(ip) {
        None => next.run(request).await,
        Some(retry_after) => {
            warn!(ip = %ip, retry_after_secs = retry_after, "enrollment rate limit exceeded");
            let body = serde_json::json!({
                "error": "enrollment_rate_limited",
                "message": "Too many enrollment attempts. Try again later.",
                "retry_after_seconds": retry_after,
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}
