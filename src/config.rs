use std::net::SocketAddr;
use thiserror::Error;

use crate::security::DevelopmentBypass;

const DEV_JWT_SECRET: &str = "development-only-jwt-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be set outside development")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub bind_addr: SocketAddr,
    pub database_path: String,
    pub api_key_fallback: Option<String>,
    pub jwt_secret: String,
    pub site_url: String,
    pub show_sensitive_data: bool,
    pub session_ttl_seconds: i64,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let environment = match var("APP_ENV").as_deref() {
            None | Some("production") => Environment::Production,
            Some("development") => Environment::Development,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "APP_ENV",
                    value: other.to_string(),
                })
            }
        };

        let bind_raw = var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:3000".to_string());
        let bind_addr: SocketAddr = bind_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "BIND_ADDR",
            value: bind_raw.clone(),
        })?;

        let jwt_secret = match var("JWT_SECRET") {
            Some(secret) => secret,
            None if environment.is_development() => DEV_JWT_SECRET.to_string(),
            None => return Err(ConfigError::Missing("JWT_SECRET")),
        };

        let session_ttl_seconds = match var("SESSION_TTL_SECONDS") {
            Some(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|ttl| *ttl > 0)
                .ok_or(ConfigError::Invalid {
                    name: "SESSION_TTL_SECONDS",
                    value: raw,
                })?,
            None => 3600,
        };

        Ok(Self {
            environment,
            bind_addr,
            database_path: var("DATABASE_PATH").unwrap_or_else(|| "db/auth_gateway.db".to_string()),
            api_key_fallback: var("API_KEY"),
            jwt_secret,
            site_url: var("SITE_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            show_sensitive_data: var("SHOW_SENSITIVE_DATA").as_deref() == Some("true"),
            session_ttl_seconds,
        })
    }

    /// The fallback key is honoured only in development.
    pub fn development_bypass(&self) -> DevelopmentBypass {
        match (&self.api_key_fallback, self.environment) {
            (Some(secret), Environment::Development) => DevelopmentBypass::enabled(secret.clone()),
            _ => DevelopmentBypass::disabled(),
        }
    }
}
