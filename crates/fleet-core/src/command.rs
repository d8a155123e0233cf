//! Command-type registry and typed payloads
//!
//! Every command submitted to the control plane carries a `command_type`
//! tag and an opaque JSON payload. The registry below enumerates the
//! recognized tags and deserializes the payload into its typed shape at
//! submit time; the stored payload stays opaque JSON and the agent
//! dispatches on the tag.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

/// Recognized command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    RunCommand,
    UpdateAgent,
    UpdatePackage,
}

impl CommandType {
    /// Type as its wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::RunCommand => "RunCommand",
            CommandType::UpdateAgent => "UpdateAgent",
            CommandType::UpdatePackage => "UpdatePackage",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RunCommand" => Ok(CommandType::RunCommand),
            "UpdateAgent" => Ok(CommandType::UpdateAgent),
            "UpdatePackage" => Ok(CommandType::UpdatePackage),
            other => Err(Error::UnknownCommandType(other.to_string())),
        }
    }
}

/// Shell command execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCommand {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<i64>,
}

/// Agent binary update request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateAgent {
    pub version: String,
    pub url: String,
}

/// Package manager action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    Install,
    Remove,
    Upgrade,
}

/// Package install/remove/upgrade request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePackage {
    pub packages: Vec<String>,
    pub action: PackageAction,
}

/// Validate a payload against the schema registered for `command_type`.
///
/// Unknown types are rejected outright. The payload itself stays opaque;
/// this only proves it deserializes into the type's shape and satisfies
/// the per-field constraints.
pub fn validate_payload(command_type: &str, payload: &Value) -> Result<CommandType> {
    let kind: CommandType = command_type.parse()?;
    match kind {
        CommandType::RunCommand => {
            let run: RunCommand = serde_json::from_value(payload.clone())
                .map_err(|e| Error::validation(format!("invalid RunCommand payload: {e}")))?;
            if run.cmd.trim().is_empty() {
                return Err(Error::validation("cmd must not be empty"));
            }
        }
        CommandType::UpdateAgent => {
            let update: UpdateAgent = serde_json::from_value(payload.clone())
                .map_err(|e| Error::validation(format!("invalid UpdateAgent payload: {e}")))?;
            if update.version.trim().is_empty() {
                return Err(Error::validation("version must not be empty"));
            }
            Url::parse(&update.url)
                .map_err(|_| Error::validation(format!("invalid url: {}", update.url)))?;
        }
        CommandType::UpdatePackage => {
            let update: UpdatePackage = serde_json::from_value(payload.clone())
                .map_err(|e| Error::validation(format!("invalid UpdatePackage payload: {e}")))?;
            if update.packages.is_empty() {
                return Err(Error::validation("packages must not be empty"));
            }
            if update.packages.iter().any(|p| p.trim().is_empty()) {
                return Err(Error::validation("package names must not be empty"));
            }
        }
    }
    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_command_ok() {
        let payload = json!({"cmd": "echo hi", "timeout_sec": 5});
        assert_eq!(
            validate_payload("RunCommand", &payload).unwrap(),
            CommandType::RunCommand
        );
    }

    #[test]
    fn test_run_command_missing_cmd() {
        assert!(validate_payload("RunCommand", &json!({})).is_err());
        assert!(validate_payload("RunCommand", &json!({"cmd": "  "})).is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = validate_payload("Reboot", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownCommandType(_)));
    }

    #[test]
    fn test_update_agent_url_checked() {
        let ok = json!({"version": "1.2.0", "url": "https://example.com/agent.tar.gz"});
        assert!(validate_payload("UpdateAgent", &ok).is_ok());

        let bad = json!({"version": "1.2.0", "url": "not a url"});
        assert!(validate_payload("UpdateAgent", &bad).is_err());
    }

    #[test]
    fn test_update_package_action_set() {
        let ok = json!({"packages": ["curl"], "action": "install"});
        assert!(validate_payload("UpdatePackage", &ok).is_ok());

        let bad_action = json!({"packages": ["curl"], "action": "purge"});
        assert!(validate_payload("UpdatePackage", &bad_action).is_err());

        let empty = json!({"packages": [], "action": "remove"});
        assert!(validate_payload("UpdatePackage", &empty).is_err());
    }
}
