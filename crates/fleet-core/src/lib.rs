//! # Fleet Core
//!
//! Shared domain types for the fleet control plane and edge agent:
//! the command status state machine, log stream kinds, and the
//! command-type registry with payload validation.
//!
//! ## Modules
//!
//! - [`status`] - Command status state machine and stream kinds
//! - [`command`] - Command-type registry and typed payloads
//! - [`error`] - Core error types

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod command;
pub mod error;
pub mod status;

pub use command::{validate_payload, CommandType, PackageAction, RunCommand, UpdateAgent, UpdatePackage};
pub use error::{Error, Result};
pub use status::{CommandStatus, StreamKind};
