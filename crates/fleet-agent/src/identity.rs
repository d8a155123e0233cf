//! Persisted node identity
//!
//! The agent's identity is a JSON file holding the stable node id, the
//! current bearer token, and the host facts reported at registration. The
//! file carries restrictive permissions since it holds the token.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{AgentError, Result};

/// Node identity as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub node_id: String,
    pub jwt_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Identity file manager
#[derive(Debug, Clone)]
pub struct IdentityManager {
    path: PathBuf,
}

impl IdentityManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the identity file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load identity, or `None` when the file does not exist yet
    pub fn load(&self) -> Result<Option<Identity>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let identity: Identity = serde_json::from_str(&data)
            .map_err(|e| AgentError::generic(format!("corrupt identity file: {e}")))?;
        Ok(Some(identity))
    }

    /// Persist identity with mode 0600
    pub fn save(&self, identity: &Identity) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(identity)?;
        std::fs::write(&self.path, data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Replace the stored token, keeping node id and metadata
    pub fn update_token(&self, token: &str) -> Result<()> {
        let mut identity = self
            .load()?
            .ok_or_else(|| AgentError::generic("identity not found"))?;
        identity.jwt_token = token.to_string();
        self.save(&identity)
    }
}
