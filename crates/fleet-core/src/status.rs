//! Command status state machine and stream kinds

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Lifecycle status of a command.
///
/// A command moves `queued → running → streaming → {success, failed, timeout}`.
/// `streaming` is optional; a command may go straight from `running` to a
/// terminal status. Terminal statuses are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Waiting for the owning node to poll
    Queued,
    /// Leased to the owning node
    Running,
    /// Node is pushing log chunks
    Streaming,
    /// Exited with code 0
    Success,
    /// Exited non-zero or failed to spawn
    Failed,
    /// Killed by the execution deadline
    Timeout,
}

impl CommandStatus {
    /// All statuses a command can carry
    pub const ALL: [CommandStatus; 6] = [
        CommandStatus::Queued,
        CommandStatus::Running,
        CommandStatus::Streaming,
        CommandStatus::Success,
        CommandStatus::Failed,
        CommandStatus::Timeout,
    ];

    /// Whether this status is terminal (absorbing)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Success | CommandStatus::Failed | CommandStatus::Timeout
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Self-transitions are allowed for non-terminal states so that
    /// idempotent retries of the same update do not error.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            CommandStatus::Queued => matches!(next, CommandStatus::Queued | CommandStatus::Running),
            CommandStatus::Running => !matches!(next, CommandStatus::Queued),
            CommandStatus::Streaming => {
                matches!(next, CommandStatus::Streaming) || next.is_terminal()
            }
            _ => false,
        }
    }

    /// Status as its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Running => "running",
            CommandStatus::Streaming => "streaming",
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(CommandStatus::Queued),
            "running" => Ok(CommandStatus::Running),
            "streaming" => Ok(CommandStatus::Streaming),
            "success" => Ok(CommandStatus::Success),
            "failed" => Ok(CommandStatus::Failed),
            "timeout" => Ok(CommandStatus::Timeout),
            other => Err(Error::validation(format!("invalid status: {other}"))),
        }
    }
}

/// Which child stream a log chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Stream as its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(StreamKind::Stdout),
            "stderr" => Ok(StreamKind::Stderr),
            other => Err(Error::validation(format!("invalid stream: {other}"))),
        }
    }
}
