//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

use fleet_db::DbError;

/// Result type alias for handler operations
pub type Result<T> = std::result::Result<T, ApiError>;

/// Tagged error kinds the handlers translate to HTTP statuses
#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed or rejected input, including ownership mismatches
    #[error("{0}")]
    Validation(String),

    /// Missing, malformed, invalid, or expired bearer token
    #[error("{0}")]
    Unauthorized(String),

    /// Node or command does not exist
    #[error("{0}")]
    NotFound(String),

    /// Backend failure; internal detail is logged, not leaked
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Validation(msg) => ApiError::Validation(msg),
            DbError::Conflict(msg) => ApiError::Validation(msg),
            DbError::NotFound(msg) => ApiError::NotFound(msg),
            DbError::Sqlx(e) => {
                tracing::error!(error = %e, "database failure");
                ApiError::Internal("storage failure".to_string())
            }
            DbError::Generic(msg) => {
                tracing::error!(error = %msg, "backend failure");
                ApiError::Internal("internal error".to_string())
            }
        }
    }
}

impl From<fleet_core::Error> for ApiError {
    fn from(err: fleet_core::Error) -> Self {
        ApiError::Validation(err.to_string())
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, String>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
            details: None,
        };
        (status, Json(body)).into_response()
    }
}
