//! Node registration, heartbeat, and listing

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::node_id_from_headers;
use crate::error::{ApiError, Result};
use crate::AppState;
use fleet_db::AgentMetadataRow;

/// A node is reported healthy while heartbeats are this fresh
const HEALTHY_WINDOW_SECS: i64 = 30;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub node_id: String,
    #[serde(default)]
    pub attrs: Option<Value>,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub token: String,
    pub node_id: String,
    pub expires_in: i64,
}

/// Register a node. Idempotent: re-registering the same node id overwrites
/// its attributes, refreshes last_seen_at, and mints a fresh token.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>> {
    if req.node_id.trim().is_empty() {
        return Err(ApiError::validation("node_id is required"));
    }

    let attrs = req.attrs.unwrap_or_else(|| Value::Object(Default::default()));
    if !attrs.is_object() {
        return Err(ApiError::validation("attrs must be an object"));
    }

    state.repo.register_node(&req.node_id, &attrs).await?;

    if let Some(metadata) = AgentMetadataRow::from_attrs(&attrs) {
        state
            .repo
            .upsert_agent_metadata(&req.node_id, &metadata)
            .await?;
    }

    let token = state.jwt.generate(&req.node_id)?;
    tracing::info!(node_id = %req.node_id, "node registered");

    Ok(Json(RegisterResponse {
        token,
        node_id: req.node_id,
        expires_in: state.jwt_expiration_secs,
    }))
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: String,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Heartbeat. 404 when the node row is gone, which tells the agent to
/// re-register.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<OkResponse>> {
    let token_node = node_id_from_headers(&state.jwt, &headers)?;
    if token_node != req.node_id {
        return Err(ApiError::validation("node_id does not match token subject"));
    }

    if !state.repo.touch_node(&req.node_id).await? {
        return Err(ApiError::not_found("node not found"));
    }

    Ok(Json(OkResponse { ok: true }))
}

#[derive(Serialize)]
pub struct NodeResponse {
    pub node_id: String,
    pub attrs: Value,
    pub last_seen_at: String,
    pub disabled: bool,
    pub is_healthy: bool,
}

#[derive(Serialize)]
pub struct ListNodesResponse {
    pub nodes: Vec<NodeResponse>,
}

/// Admin view of all registered nodes
pub async fn list_nodes(State(state): State<AppState>) -> Result<Json<ListNodesResponse>> {
    let now = Utc::now();
    let nodes = state
        .repo
        .list_nodes()
        .await?
        .into_iter()
        .map(|node| {
            let is_healthy =
                !node.disabled && now - node.last_seen_at < Duration::seconds(HEALTHY_WINDOW_SECS);
            NodeResponse {
                attrs: node.attrs_json(),
                last_seen_at: node.last_seen_at.to_rfc3339(),
                disabled: node.disabled,
                is_healthy,
                node_id: node.node_id,
            }
        })
        .collect();

    Ok(Json(ListNodesResponse { nodes }))
}
