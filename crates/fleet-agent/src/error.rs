//! Agent error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Non-2xx response from the control service
    #[error("server returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Transport-level request failure
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Local store failure
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Bad or missing configuration
    #[error("config error: {0}")]
    Config(String),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

impl AgentError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a generic error
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Whether this is an HTTP 404 from the control service.
    /// The heartbeat loop uses this to trigger re-registration.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Http { status: 404, .. })
    }
}
