// API-key gated auth gateway
// Library root

pub mod app;
pub mod audit;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod models;
pub mod rate_limit;
pub mod security;
pub mod validation;

// Re-export commonly used items
pub use app::{router, AppState};
pub use config::Config;
pub use database::Database;
pub use errors::{AdmissionError, ApiError};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use security::{ApiKeyContext, ApiKeyValidator};
