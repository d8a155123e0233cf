//! # Fleet Server
//!
//! Control service for the fleet: accepts admin-submitted commands, hands
//! them to the owning node on poll, ingests streamed log chunks with
//! exactly-once storage, and tracks command status through its state
//! machine.
//!
//! ## Modules
//!
//! - [`config`] - Environment configuration
//! - [`auth`] - JWT mint and verify
//! - [`handlers`] - HTTP endpoint handlers
//! - [`cleanup`] - Log retention job
//! - [`error`] - API error mapping

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::auth::JwtService;
use crate::config::Config;
use fleet_db::Repository;

/// Number of queued commands a single poll may lease
pub const LEASE_BATCH_SIZE: i64 = 5;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub repo: Repository,
    pub jwt: Arc<JwtService>,
    pub jwt_expiration_secs: i64,
}

impl AppState {
    /// Build state from config and an opened repository
    pub fn new(repo: Repository, config: &Config) -> Self {
        Self {
            repo,
            jwt: Arc::new(JwtService::new(&config.jwt_secret, config.jwt_expiration_secs)),
            jwt_expiration_secs: config.jwt_expiration_secs,
        }
    }
}

/// Create the complete API router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Agent endpoints
        .route("/v1/agents/register", post(handlers::agents::register))
        .route("/v1/agents/heartbeat", post(handlers::agents::heartbeat))
        .route("/v1/agents", get(handlers::agents::list_nodes))
        // Command endpoints
        .route("/v1/commands/submit", post(handlers::commands::submit))
        .route("/v1/commands", get(handlers::commands::list))
        .route("/v1/commands", delete(handlers::commands::delete_queued))
        .route("/v1/commands/next", get(handlers::commands::next))
        .route("/v1/commands/logs", post(handlers::commands::push_logs))
        .route("/v1/commands/status", post(handlers::commands::update_status))
        .route("/v1/commands/:command_id/logs", get(handlers::commands::get_logs))
        // Health & readiness
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
