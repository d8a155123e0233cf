//! Error types for fleet-core

use thiserror::Error;

/// Result type alias for fleet-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// Payload or request validation error
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown command type
    #[error("Unknown command type: {0}")]
    UnknownCommandType(String),

    /// Illegal status transition
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid-transition error
    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    /// Create a generic error
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::validation("cmd is required");
        assert!(err.to_string().contains("Validation failed"));

        let err = Error::UnknownCommandType("Reboot".to_string());
        assert!(err.to_string().contains("Reboot"));
    }
}
