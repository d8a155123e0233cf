//! Environment configuration

use crate::error::{ApiError, Result};

const JWT_SECRET_PLACEHOLDER: &str = "change-me-in-production";

/// Control service configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub jwt_expiration_secs: i64,
    pub log_retention_days: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// `JWT_SIGNING_SECRET` is required; startup fails when it is unset or
    /// still carries the placeholder value.
    pub fn from_env() -> Result<Self> {
        let jwt_secret = get_env("JWT_SIGNING_SECRET", JWT_SECRET_PLACEHOLDER);
        if jwt_secret == JWT_SECRET_PLACEHOLDER || jwt_secret.is_empty() {
            return Err(ApiError::internal("JWT_SIGNING_SECRET must be set"));
        }

        Ok(Self {
            server_port: get_env("SERVER_PORT", "8080")
                .parse()
                .map_err(|_| ApiError::internal("SERVER_PORT must be a port number"))?,
            database_url: get_env("DATABASE_URL", "sqlite://fleet.db"),
            jwt_secret,
            jwt_expiration_secs: 86_400,
            log_retention_days: get_env("LOG_RETENTION_DAYS", "7")
                .parse()
                .map_err(|_| ApiError::internal("LOG_RETENTION_DAYS must be an integer"))?,
        })
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
