//! Request throttling for sensitive endpoint classes.
//!
//! Fixed-window counters keyed by `(client address, endpoint class)`. Each
//! class carries its own budget; the login class additionally forgives
//! successful attempts so legitimate repeated logins never exhaust the
//! budget while brute-force guessing still runs into the wall.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::error::ApiError;
use crate::config::RateLimitConfig;
use crate::AppState;

/// Endpoint classes with distinct budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    /// Login attempts (successful attempts excluded from the count)
    Login,
    /// Account creation
    Signup,
    /// Password reset requests
    PasswordReset,
    /// General API endpoints
    Api,
}

/// Budget for one class.
#[derive(Debug, Clone, Copy)]
struct Policy {
    limit: u32,
    window: Duration,
    /// Decrement the counter again when the wrapped handler succeeds.
    skip_successful: bool,
}

/// Entry in the rate limit tracker
#[derive(Debug, Clone)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Information about rate limit status
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: u64,
}

/// Thread-safe per-class fixed-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<(IpAddr, RateLimitClass), WindowEntry>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    fn policy(&self, class: RateLimitClass) -> Policy {
        match class {
            RateLimitClass::Login => Policy {
                limit: self.config.login_limit,
                window: Duration::from_secs(self.config.login_window_seconds),
                skip_successful: true,
            },
            RateLimitClass::Signup => Policy {
                limit: self.config.signup_limit,
                window: Duration::from_secs(self.config.signup_window_seconds),
                skip_successful: false,
            },
            RateLimitClass::PasswordReset => Policy {
                limit: self.config.password_reset_limit,
                window: Duration::from_secs(self.config.password_reset_window_seconds),
                skip_successful: false,
            },
            RateLimitClass::Api => Policy {
                limit: self.config.api_limit,
                window: Duration::from_secs(self.config.api_window_seconds),
                skip_successful: false,
            },
        }
    }

    /// Count a request against its window.
    /// Returns Ok(info) if allowed, Err(retry_after_seconds) if limited.
    pub fn check(&self, ip: IpAddr, class: RateLimitClass) -> Result<RateLimitInfo, u64> {
        if !self.config.enabled {
            return Ok(RateLimitInfo {
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_after: 0,
            });
        }

        let policy = self.policy(class);
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry((ip, class))
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: now,
            });

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= policy.window {
            // The window expired; start a fresh one.
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_after = policy
            .window
            .saturating_sub(now.duration_since(entry.window_start))
            .as_secs();

        if entry.count >= policy.limit {
            return Err(reset_after.max(1));
        }

        entry.count += 1;
        Ok(RateLimitInfo {
            limit: policy.limit,
            remaining: policy.limit - entry.count,
            reset_after,
        })
    }

    /// Un-count one request, used when a login succeeds. A request counted
    /// in an already-rotated window decrements nothing.
    pub fn forgive(&self, ip: IpAddr, class: RateLimitClass) {
        if let Some(mut entry) = self.entries.get_mut(&(ip, class)) {
            entry.count = entry.count.saturating_sub(1);
        }
    }

    fn skip_successful(&self, class: RateLimitClass) -> bool {
        self.policy(class).skip_successful
    }

    /// Evict entries whose window is long gone to bound memory.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|key, entry| {
            let window = self.policy(key.1).window;
            now.duration_since(entry.window_start) < window * 2
        });
    }

    /// Number of tracked entries (for monitoring)
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Extract client IP from request headers
fn extract_client_ip(request: &Request<Body>) -> IpAddr {
    // X-Forwarded-For first (reverse proxy setups); the first hop is the
    // original client.
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip_str) = value.split(',').next() {
                if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    "127.0.0.1".parse().unwrap()
}

/// Rate limiting middleware for the login class
pub async fn rate_limit_login(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_class(state, request, next, RateLimitClass::Login).await
}

/// Rate limiting middleware for the signup class
pub async fn rate_limit_signup(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_class(state, request, next, RateLimitClass::Signup).await
}

/// Rate limiting middleware for the password reset class
pub async fn rate_limit_password_reset(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_class(state, request, next, RateLimitClass::PasswordReset).await
}

/// Rate limiting middleware for general API endpoints
pub async fn rate_limit_api(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_class(state, request, next, RateLimitClass::Api).await
}

/// Core rate limiting logic
async fn rate_limit_with_class(
    state: Arc<AppState>,
    request: Request<Body>,
    next: Next,
    class: RateLimitClass,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&request);

    match state.rate_limiter.check(ip, class) {
        Ok(info) => {
            let response = next.run(request).await;

            if state.rate_limiter.skip_successful(class) && response.status().is_success() {
                state.rate_limiter.forgive(ip, class);
            }

            let (mut parts, body) = response.into_parts();
            parts
                .headers
                .insert("X-RateLimit-Limit", info.limit.to_string().parse().unwrap());
            parts.headers.insert(
                "X-RateLimit-Remaining",
                info.remaining.to_string().parse().unwrap(),
            );
            parts.headers.insert(
                "X-RateLimit-Reset",
                info.reset_after.to_string().parse().unwrap(),
            );

            Ok(Response::from_parts(parts, body))
        }
        Err(retry_after) => {
            let mut response = ApiError::rate_limited(retry_after).into_response();
            response
                .headers_mut()
                .insert("Retry-After", retry_after.to_string().parse().unwrap());
            response
                .headers_mut()
                .insert("X-RateLimit-Remaining", "0".parse().unwrap());
            Err(response)
        }
    }
}

/// Spawn a background task to periodically evict stale window entries
pub fn spawn_sweep_task(rate_limiter: Arc<RateLimiter>, sweep_interval_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(sweep_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            rate_limiter.sweep_expired();
            tracing::debug!(
                "Rate limiter sweep complete, {} entries remaining",
                rate_limiter.entry_count()
            );
        }
    });
}
