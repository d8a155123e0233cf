//! YAML + environment configuration
//!
//! The agent reads an optional YAML file (path from `CONFIG_PATH`) and lets
//! individual environment variables override it, so container deployments
//! can tweak a single knob without shipping a new file.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AgentError, Result};

const DEFAULT_BASE_PATH: &str = "/var/lib/fleet-agent";

/// File shape of the agent configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlConfig {
    pub agent: YamlAgent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlAgent {
    pub svc_url: Option<String>,
    pub identity_path: Option<String>,
    pub chunk: YamlChunk,
    pub heartbeat: YamlHeartbeat,
    pub storage: YamlStorage,
    pub execution: YamlExecution,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlChunk {
    pub size: Option<usize>,
    pub interval_sec: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlHeartbeat {
    pub interval_sec: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlStorage {
    pub db_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct YamlExecution {
    pub default_timeout_sec: Option<u64>,
    pub worker_count: Option<usize>,
    pub channel_size: Option<usize>,
}

/// Resolved agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub agent_svc_url: String,
    pub identity_path: PathBuf,
    pub db_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_interval_sec: u64,
    pub heartbeat_interval_sec: u64,
    pub default_timeout_sec: u64,
    pub worker_count: usize,
    pub channel_size: usize,
}

impl Config {
    /// Load configuration: YAML file first, environment overrides second,
    /// hostname-scoped defaults last.
    pub fn load() -> Result<Self> {
        let config_path = get_env("CONFIG_PATH", "/etc/fleet-agent/config.yaml");
        let yaml = match std::fs::read_to_string(&config_path) {
            Ok(contents) => serde_yaml::from_str::<YamlConfig>(&contents)
                .map_err(|e| AgentError::config(format!("failed to parse {config_path}: {e}")))?,
            Err(_) => YamlConfig::default(),
        };

        Self::resolve(yaml)
    }

    fn resolve(yaml: YamlConfig) -> Result<Self> {
        let hostname = get_env("HOSTNAME", "fleet-agent");
        let base = PathBuf::from(DEFAULT_BASE_PATH).join(&hostname);

        let agent_svc_url = env_or(
            "AGENT_SVC_URL",
            yaml.agent
                .svc_url
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
        );
        if agent_svc_url.trim().is_empty() {
            return Err(AgentError::config("AGENT_SVC_URL must be set"));
        }

        let identity_path = env_path("IDENTITY_PATH")
            .or(yaml.agent.identity_path.map(PathBuf::from))
            .unwrap_or_else(|| base.join("identity.json"));
        let db_path = env_path("DB_PATH")
            .or(yaml.agent.storage.db_path.map(PathBuf::from))
            .unwrap_or_else(|| base.join("agent.db"));

        let worker_count = env_parse("WORKER_COUNT", yaml.agent.execution.worker_count.unwrap_or(2));
        let channel_size =
            env_parse("CHANNEL_SIZE", yaml.agent.execution.channel_size.unwrap_or(100));

        Ok(Self {
            agent_svc_url,
            identity_path,
            db_path,
            chunk_size: env_parse("CHUNK_SIZE", yaml.agent.chunk.size.unwrap_or(16_384)),
            chunk_interval_sec: env_parse(
                "CHUNK_INTERVAL_SEC",
                yaml.agent.chunk.interval_sec.unwrap_or(1),
            ),
            heartbeat_interval_sec: env_parse(
                "HEARTBEAT_INTERVAL_SEC",
                yaml.agent.heartbeat.interval_sec.unwrap_or(30),
            ),
            default_timeout_sec: env_parse(
                "DEFAULT_TIMEOUT_SEC",
                yaml.agent.execution.default_timeout_sec.unwrap_or(300),
            ),
            worker_count: worker_count.max(1),
            channel_size: channel_size.max(1),
        })
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or(default)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
