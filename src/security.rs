use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::{AdmissionError, ApiError};
use crate::models::{ApiKey, Permissions};

pub const API_KEY_HEADER: &str = "x-api-key";

const KEY_PREFIX: &str = "ak";

/// Read/write access to the `api_keys` table needed by the validator.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Looks up an active key whose value equals `key_value`.
    async fn find_active_key(&self, key_value: &str) -> Result<Option<ApiKey>, ApiError>;

    async fn touch_last_used(&self, key_id: i64, at: DateTime<Utc>) -> Result<(), ApiError>;
}

/// Static fallback key accepted when no stored key matches. Development only.
#[derive(Clone, Default)]
pub struct DevelopmentBypass {
    secret: Option<String>,
}

impl DevelopmentBypass {
    pub fn enabled(secret: String) -> Self {
        Self {
            secret: Some(secret).filter(|s| !s.is_empty()),
        }
    }

    pub fn disabled() -> Self {
        Self { secret: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    fn accepts(&self, presented: &str) -> bool {
        match &self.secret {
            Some(secret) => secret.as_bytes().ct_eq(presented.as_bytes()).into(),
            None => false,
        }
    }
}

impl std::fmt::Debug for DevelopmentBypass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevelopmentBypass")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// What the rest of the request gets to know about its API key.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyContext {
    /// `None` when admitted through the development bypass.
    pub key_id: Option<i64>,
    pub permissions: Permissions,
}

impl ApiKeyContext {
    pub fn has_permission(&self, scope: &str) -> bool {
        has_permission(&self.permissions, scope)
    }
}

pub fn has_permission(permissions: &Permissions, scope: &str) -> bool {
    permissions.allows(scope)
}

pub fn require_scope(context: &ApiKeyContext, scope: &str) -> Result<(), AdmissionError> {
    if context.has_permission(scope) {
        Ok(())
    } else {
        Err(AdmissionError::InsufficientScope(scope.to_string()))
    }
}

pub struct ApiKeyValidator {
    store: Arc<dyn ApiKeyStore>,
    bypass: DevelopmentBypass,
}

impl ApiKeyValidator {
    pub fn new(store: Arc<dyn ApiKeyStore>, bypass: DevelopmentBypass) -> Self {
        Self { store, bypass }
    }

    /// Authenticates the caller by its `x-api-key` header. Never surfaces store errors.
    pub async fn validate(&self, headers: &HeaderMap) -> Result<ApiKeyContext, AdmissionError> {
        let presented = headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(AdmissionError::MissingKey)?;

        let record = match self.store.find_active_key(presented).await {
            Ok(record) => record,
            Err(err) => {
                tracing::error!(error = %err, "api key lookup failed");
                None
            }
        };

        let Some(record) = record else {
            if self.bypass.accepts(presented) {
                tracing::debug!("admitted through development api key");
                return Ok(ApiKeyContext::default());
            }
            return Err(AdmissionError::InvalidKey);
        };

        let now = Utc::now();
        if record.is_expired_at(now) {
            return Err(AdmissionError::ExpiredKey);
        }

        if let Err(err) = self.store.touch_last_used(record.id, now).await {
            tracing::warn!(key_id = record.id, error = %err, "failed to record api key usage");
        }

        Ok(ApiKeyContext {
            key_id: Some(record.id),
            permissions: record.permissions,
        })
    }
}

pub async fn require_api_key(
    State(validator): State<Arc<ApiKeyValidator>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let outcome = validator.validate(request.headers()).await;
    match outcome {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(err) => {
            tracing::info!(path = %request.uri().path(), reason = err.code(), "request rejected");
            err.into_response()
        }
    }
}

/// New key value and the hash stored in its place.
pub fn generate_api_key() -> (String, String) {
    let mut random_bytes = [0u8; 20];
    rand::thread_rng().fill(&mut random_bytes);

    let key_value = format!(
        "{}_{}_{}",
        KEY_PREFIX,
        Utc::now().timestamp_millis(),
        base32::encode(base32::Alphabet::RFC4648 { padding: false }, &random_bytes).to_lowercase()
    );
    let key_hash = hash_secret(&key_value);

    (key_value, key_hash)
}

/// Short, non-secret prefix shown in listings.
pub fn display_prefix(key_value: &str) -> String {
    key_value.chars().take(12).collect()
}

pub fn hash_secret(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Random URL-safe token for sessions and emailed links.
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, &bytes).to_lowercase()
}
