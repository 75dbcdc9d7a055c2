use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Outcome of the admission layer when a request is turned away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Unauthorized: API key not found")]
    MissingKey,

    #[error("Unauthorized: API key is not valid")]
    InvalidKey,

    #[error("Unauthorized: API key has expired")]
    ExpiredKey,

    #[error("Unauthorized: missing {0} permission")]
    InsufficientScope(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited {
        limit: u32,
        reset_time: DateTime<Utc>,
    },
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::MissingKey => "missing_api_key",
            AdmissionError::InvalidKey => "invalid_api_key",
            AdmissionError::ExpiredKey => "expired_api_key",
            AdmissionError::InsufficientScope(_) => "insufficient_scope",
            AdmissionError::RateLimited { .. } => "rate_limit_exceeded",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let mut response = error_envelope(&self.to_string(), Some(self.code()), None);

        if let AdmissionError::RateLimited { limit, reset_time } = &self {
            // Reset is reported in whole seconds, rounded up.
            let reset_secs = (reset_time.timestamp_millis() + 999).div_euclid(1000);
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(*limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(reset_secs));
        }

        response
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Email has not been verified. Please verify your email first.")]
    EmailNotConfirmed,

    #[error("Your account is not active. Please contact an administrator.")]
    AccountInactive,

    #[error("Email is already registered")]
    UserExists,

    #[error("User not found")]
    UserNotFound,

    #[error("The new password must be different from the old password")]
    SamePassword,

    #[error("Unauthorized: token not found")]
    MissingToken,

    #[error("Unauthorized: token is not valid")]
    InvalidToken,

    #[error("Token is invalid or has expired")]
    TokenExpired,

    #[error("Current password is incorrect")]
    WrongPassword,

    #[error("API key not found")]
    KeyNotFound,

    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Something went wrong. Please try again later.")]
    Internal,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Database(_) => "database_error",
            ApiError::Io(_) => "internal_error",
            ApiError::Admission(err) => err.code(),
            ApiError::InvalidCredentials => "invalid_credentials",
            ApiError::EmailNotConfirmed => "email_not_confirmed",
            ApiError::AccountInactive => "account_inactive",
            ApiError::UserExists => "user_already_exists",
            ApiError::UserNotFound => "user_not_found",
            ApiError::SamePassword => "same_password",
            ApiError::MissingToken => "missing_token",
            ApiError::InvalidToken => "invalid_token",
            ApiError::TokenExpired => "token_expired",
            ApiError::WrongPassword => "wrong_password",
            ApiError::KeyNotFound => "api_key_not_found",
            ApiError::Validation(_) => "validation_failed",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::MethodNotAllowed => "method_not_allowed",
            ApiError::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Admission(err) => err.into_response(),
            ApiError::Database(err) => {
                tracing::error!(error = %err, "database error");
                error_envelope(
                    "Something went wrong. Please try again later.",
                    Some("database_error"),
                    None,
                )
            }
            ApiError::Io(err) => {
                tracing::error!(error = %err, "i/o error");
                error_envelope(
                    "Something went wrong. Please try again later.",
                    Some("internal_error"),
                    None,
                )
            }
            ApiError::Validation(errors) => {
                error_envelope("Validation failed", Some("validation_failed"), Some(errors))
            }
            other => error_envelope(&other.to_string(), Some(other.code()), None),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
            _ => ApiError::InvalidToken,
        }
    }
}

impl From<argon2::password_hash::Error> for ApiError {
    fn from(err: argon2::password_hash::Error) -> Self {
        tracing::error!(error = %err, "password hashing failed");
        ApiError::Internal
    }
}

/// Every rejection goes out as HTTP 200; callers read `status` instead.
fn error_envelope(message: &str, code: Option<&str>, errors: Option<Vec<FieldError>>) -> Response {
    let mut body = json!({
        "status": "error",
        "message": message,
    });
    if let Some(code) = code {
        body["code"] = json!(code);
    }
    if let Some(errors) = errors {
        body["errors"] = json!(errors);
    }
    (StatusCode::OK, Json(body)).into_response()
}
