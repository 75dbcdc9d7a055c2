use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    body::Body,
    extract::{OriginalUri, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AdmissionError;

/// Bucket shared by every client that arrives without a forwarded address.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_seconds: u32,
}

impl RateLimitConfig {
    pub const fn new(limit: u32, window_seconds: u32) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    pub const fn login() -> Self {
        Self::new(10, 60)
    }

    pub const fn register() -> Self {
        Self::new(5, 60)
    }

    pub const fn forgot_password() -> Self {
        Self::new(3, 3600)
    }

    // Used for reset and change password alike.
    pub const fn password_update() -> Self {
        Self::new(5, 3600)
    }

    fn window(&self) -> Duration {
        Duration::seconds(i64::from(self.window_seconds))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::login()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitEntry {
    fn fresh(now: DateTime<Utc>, window: Duration) -> Self {
        Self {
            count: 1,
            reset_time: now + window,
        }
    }

    /// Strictly after: a request landing on `reset_time` still belongs to the old window.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.reset_time
    }
}

/// Storage for window counters.
///
/// The limiter serialises every get/increment/set sequence behind its own
/// lock, so implementations only need to be `Send`.
pub trait CounterStore: Send {
    fn get(&self, key: &str) -> Option<RateLimitEntry>;

    fn set(&mut self, key: String, entry: RateLimitEntry);

    /// Drops every entry whose window has passed. Returns how many were removed.
    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: HashMap<String, RateLimitEntry>,
}

impl CounterStore for InMemoryCounterStore {
    fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: String, entry: RateLimitEntry) {
        self.entries.insert(key, entry);
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before - self.entries.len()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    #[error("Rate limit exceeded")]
    LimitExceeded {
        limit: u32,
        reset_time: DateTime<Utc>,
    },
}

impl From<RateLimitError> for AdmissionError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::LimitExceeded { limit, reset_time } => {
                AdmissionError::RateLimited { limit, reset_time }
            }
        }
    }
}

/// Fixed-window request counter keyed by `(client, route)`.
#[derive(Debug, Default)]
pub struct RateLimiter<S = InMemoryCounterStore> {
    store: Mutex<S>,
}

impl RateLimiter<InMemoryCounterStore> {
    pub fn new() -> Self {
        Self::with_store(InMemoryCounterStore::default())
    }
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn check_rate_limit(
        &self,
        client: &str,
        route: &str,
        config: RateLimitConfig,
    ) -> Result<RateLimitStatus, RateLimitError> {
        self.check_rate_limit_at(client, route, config, Utc::now())
    }

    pub fn check_rate_limit_at(
        &self,
        client: &str,
        route: &str,
        config: RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitStatus, RateLimitError> {
        let key = counter_key(client, route);
        // A poisoned lock only means another task panicked mid-update; the counters are still usable.
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);

        store.sweep_expired(now);

        let entry = match store.get(&key) {
            Some(entry) if !entry.is_expired_at(now) => RateLimitEntry {
                count: entry.count.saturating_add(1),
                reset_time: entry.reset_time,
            },
            _ => RateLimitEntry::fresh(now, config.window()),
        };
        store.set(key, entry);

        if entry.count > config.limit {
            return Err(RateLimitError::LimitExceeded {
                limit: config.limit,
                reset_time: entry.reset_time,
            });
        }

        Ok(RateLimitStatus {
            limit: config.limit,
            remaining: config.limit - entry.count,
            reset_time: entry.reset_time,
        })
    }

    pub fn get_entry(&self, client: &str, route: &str) -> Option<RateLimitEntry> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        store.get(&counter_key(client, route))
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn counter_key(client: &str, route: &str) -> String {
    format!("{}:{}", client, route)
}

/// Client identity from proxy headers, falling back to [`UNKNOWN_CLIENT`].
pub fn extract_client_identifier(headers: &HeaderMap) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(ip) = forwarded_for.to_str() {
            let first = ip.split(',').next().unwrap_or(ip).trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip) = real_ip.to_str() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    UNKNOWN_CLIENT.to_string()
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub config: RateLimitConfig,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self { limiter, config }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let client = extract_client_identifier(request.headers());
    // Nested routers strip their prefix; the counter key uses the full path.
    let route = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    match state
        .limiter
        .check_rate_limit(&client, &route, state.config)
    {
        Ok(_) => next.run(request).await,
        Err(err) => {
            tracing::warn!(client = %client, route = %route, limit = state.config.limit, "rate limit exceeded");
            AdmissionError::from(err).into_response()
        }
    }
}
