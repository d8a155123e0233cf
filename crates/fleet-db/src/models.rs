//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Database row for the nodes table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NodeRow {
    pub id: i64,
    pub node_id: String,
    /// JSON-encoded attribute map
    pub attrs: String,
    pub last_seen_at: DateTime<Utc>,
    pub disabled: bool,
}

impl NodeRow {
    /// Decode the attribute map
    pub fn attrs_json(&self) -> Value {
        serde_json::from_str(&self.attrs).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Database row for the node_commands table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommandRow {
    pub id: i64,
    pub command_id: String,
    pub node_id: String,
    pub command_type: String,
    /// JSON-encoded opaque payload
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i64>,
    pub error_msg: Option<String>,
}

impl CommandRow {
    /// Decode the payload
    pub fn payload_json(&self) -> Value {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

/// Database row for the command_logs table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogChunkRow {
    pub id: i64,
    pub command_id: String,
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    pub encoding: String,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// An incoming chunk to be stored
#[derive(Debug, Clone)]
pub struct NewLogChunk {
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    pub encoding: String,
    pub is_final: bool,
}

/// Database row for the agent_metadata table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetadataRow {
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub arch: Option<String>,
    pub kernel_version: Option<String>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub cpu_cores: Option<i64>,
    pub memory_mb: Option<i64>,
    pub disk_gb: Option<i64>,
}

impl AgentMetadataRow {
    /// Pull the well-known host facts out of a registration attribute map.
    ///
    /// Returns `None` when the attrs carry none of them.
    pub fn from_attrs(attrs: &Value) -> Option<Self> {
        let obj = attrs.as_object()?;
        let text = |k: &str| obj.get(k).and_then(Value::as_str).map(str::to_string);
        let num = |k: &str| obj.get(k).and_then(Value::as_i64);

        let row = Self {
            os_name: text("os_name"),
            os_version: text("os_version"),
            arch: text("arch"),
            kernel_version: text("kernel_version"),
            hostname: text("hostname"),
            ip_address: text("ip_address"),
            cpu_cores: num("cpu_cores"),
            memory_mb: num("memory_mb"),
            disk_gb: num("disk_gb"),
        };

        let empty = row.os_name.is_none()
            && row.os_version.is_none()
            && row.arch.is_none()
            && row.kernel_version.is_none()
            && row.hostname.is_none()
            && row.ip_address.is_none()
            && row.cpu_cores.is_none()
            && row.memory_mb.is_none()
            && row.disk_gb.is_none();
        if empty {
            None
        } else {
            Some(row)
        }
    }
}
