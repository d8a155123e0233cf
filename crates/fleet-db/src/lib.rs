//! # Fleet Database Layer
//!
//! SQLite-based persistence layer with sqlx for the control plane:
//! node registry, command queue, and the log chunk store whose
//! `(command_id, chunk_index, stream)` uniqueness index is the
//! idempotency anchor for log ingestion.
//!
//! ## Modules
//!
//! - [`pool`] - Database connection pool
//! - [`migrations`] - Schema migrations
//! - [`models`] - Database models
//! - [`repo`] - Repository layer for CRUD operations
//! - [`error`] - Database error types

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod repo;

pub use error::{DbError, Result};
pub use models::{AgentMetadataRow, CommandRow, LogChunkRow, NewLogChunk, NodeRow};
pub use pool::DbPool;
pub use repo::Repository;
