//! HTTP client for the control service
//!
//! One shared client instance carries the base URL and the current bearer
//! token. Re-registration swaps the token in place through
//! [`ApiClient::update_token`], so every loop holding the client picks up
//! the fresh token on its next call.

use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{AgentError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A command as served by the control service
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCommand {
    pub command_id: String,
    pub command_type: String,
    pub payload: Value,
}

/// A chunk as pushed to the control service
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    pub is_final: bool,
}

#[derive(Deserialize)]
struct RegisterResponse {
    token: String,
}

#[derive(Deserialize)]
struct CommandsResponse {
    #[serde(default)]
    commands: Vec<RemoteCommand>,
}

#[derive(Deserialize)]
struct PushLogsResponse {
    #[serde(default)]
    acked_offsets: Vec<i64>,
}

/// Control service client
pub struct ApiClient {
    base_url: String,
    token: RwLock<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(token.into()),
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Base URL of the control service
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Swap the bearer token. All in-flight loops share this client, so a
    /// single swap is visible everywhere.
    pub async fn update_token(&self, token: &str) {
        *self.token.write().await = token.to_string();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        let token = self.token.read().await;
        if token.is_empty() {
            builder
        } else {
            builder.bearer_auth(&*token)
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(AgentError::Http {
            status: status.as_u16(),
            message,
        })
    }

    /// Register the node and return the minted token. Registration is
    /// unauthenticated, so this works with an empty or stale token.
    pub async fn register(&self, node_id: &str, attrs: &Value) -> Result<String> {
        let resp = self
            .http
            .post(self.url("/v1/agents/register"))
            .json(&json!({"node_id": node_id, "attrs": attrs}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: RegisterResponse = resp.json().await?;
        Ok(body.token)
    }

    /// Send a heartbeat. A 404 means the node row is gone server-side.
    pub async fn heartbeat(&self, node_id: &str) -> Result<()> {
        let builder = self.http.post(self.url("/v1/agents/heartbeat"));
        let resp = self
            .authed(builder)
            .await
            .json(&json!({"node_id": node_id}))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Long-poll for commands, waiting at most `wait_secs` server-side
    pub async fn poll_commands(&self, wait_secs: u64) -> Result<Vec<RemoteCommand>> {
        let builder = self
            .http
            .get(self.url(&format!("/v1/commands/next?wait={wait_secs}")));
        let resp = self.authed(builder).await.send().await?;
        let resp = Self::check(resp).await?;
        let body: CommandsResponse = resp.json().await?;
        Ok(body.commands)
    }

    /// Push log chunks; returns the chunk indexes the server acked
    pub async fn push_logs(
        &self,
        command_id: &str,
        chunks: &[ChunkPayload],
    ) -> Result<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let chunk_bodies: Vec<Value> = chunks
            .iter()
            .map(|c| {
                json!({
                    "chunk_index": c.chunk_index,
                    "stream": c.stream,
                    "data": c.data,
                    "is_final": c.is_final,
                })
            })
            .collect();

        let builder = self.http.post(self.url("/v1/commands/logs"));
        let resp = self
            .authed(builder)
            .await
            .json(&json!({"command_id": command_id, "chunks": chunk_bodies}))
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let body: PushLogsResponse = resp.json().await?;
        Ok(body.acked_offsets)
    }

    /// Report a command's terminal (or streaming) status
    pub async fn update_status(
        &self,
        command_id: &str,
        status: &str,
        exit_code: Option<i64>,
        error_msg: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({"command_id": command_id, "status": status});
        if let Some(code) = exit_code {
            body["exit_code"] = json!(code);
        }
        if let Some(msg) = error_msg.filter(|m| !m.is_empty()) {
            body["error_msg"] = json!(msg);
        }

        let builder = self.http.post(self.url("/v1/commands/status"));
        let resp = self.authed(builder).await.json(&body).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}
