//! Command submission, dispatch, log ingest, and status

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::auth::node_id_from_headers;
use crate::error::{ApiError, Result};
use crate::handlers::agents::OkResponse;
use crate::{AppState, LEASE_BATCH_SIZE};
use fleet_core::{validate_payload, CommandStatus, StreamKind};
use fleet_db::{CommandRow, NewLogChunk};

const DEFAULT_WAIT_SECS: i64 = 30;
const MAX_WAIT_SECS: i64 = 60;
const DEFAULT_LIST_LIMIT: i64 = 50;
const MAX_LIST_LIMIT: i64 = 100;

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub command_type: String,
    pub node_id: String,
    pub payload: Value,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub command_id: String,
}

/// Submit a command for one node.
///
/// The payload is validated against the schema registered for its type;
/// the node must exist and not be disabled.
pub async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    if req.node_id.trim().is_empty() {
        return Err(ApiError::validation("node_id is required"));
    }
    validate_payload(&req.command_type, &req.payload)?;

    let node = state
        .repo
        .get_node(&req.node_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("node {} not found", req.node_id)))?;
    if node.disabled {
        return Err(ApiError::validation(format!(
            "node {} is disabled",
            req.node_id
        )));
    }

    let command_id = state
        .repo
        .create_command(&req.node_id, &req.command_type, &req.payload)
        .await?;

    tracing::info!(
        node_id = %req.node_id,
        command_id = %command_id,
        command_type = %req.command_type,
        "command submitted"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            command_id: command_id.to_string(),
        }),
    ))
}

#[derive(Deserialize)]
pub struct NextParams {
    pub wait: Option<String>,
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub command_type: String,
    pub payload: Value,
}

#[derive(Serialize)]
pub struct CommandsResponse {
    pub commands: Vec<CommandResponse>,
}

/// Long-poll for queued commands owned by the calling node.
///
/// `wait` outside `[1, 60]` (or non-numeric) falls back to 30 seconds. A 1s
/// ticker retries the lease until one succeeds or the deadline elapses; on
/// deadline the empty shape is returned with 200.
pub async fn next(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<NextParams>,
) -> Result<Json<CommandsResponse>> {
    let node_id = node_id_from_headers(&state.jwt, &headers)?;

    let wait = params
        .wait
        .as_deref()
        .and_then(|w| w.parse::<i64>().ok())
        .filter(|w| (1..=MAX_WAIT_SECS).contains(w))
        .unwrap_or(DEFAULT_WAIT_SECS);

    let poll = async {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let leased = state.repo.lease_commands(&node_id, LEASE_BATCH_SIZE).await?;
            if !leased.is_empty() {
                return Ok::<Vec<CommandRow>, ApiError>(leased);
            }
        }
    };

    let leased = match tokio::time::timeout(Duration::from_secs(wait as u64), poll).await {
        Ok(result) => result?,
        Err(_) => Vec::new(),
    };

    let commands = leased
        .into_iter()
        .map(|cmd| CommandResponse {
            command_id: cmd.command_id.clone(),
            command_type: cmd.command_type.clone(),
            payload: cmd.payload_json(),
        })
        .collect();

    Ok(Json(CommandsResponse { commands }))
}

#[derive(Deserialize)]
pub struct ChunkRequest {
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Deserialize)]
pub struct PushLogsRequest {
    pub command_id: String,
    pub chunks: Vec<ChunkRequest>,
}

#[derive(Serialize)]
pub struct PushLogsResponse {
    pub acked_offsets: Vec<i64>,
}

/// Ingest log chunks for a command owned by the calling node.
///
/// Storage is exactly-once under at-least-once delivery: the
/// `(command_id, chunk_index, stream)` key is upserted and only newly
/// stored or final-upgraded rows are acked. When the command is already
/// terminal, every incoming chunk is forced final so a late chunk cannot
/// mask completion.
pub async fn push_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PushLogsRequest>,
) -> Result<(StatusCode, Json<PushLogsResponse>)> {
    let node_id = node_id_from_headers(&state.jwt, &headers)?;

    Uuid::parse_str(&req.command_id)
        .map_err(|_| ApiError::validation("invalid command_id"))?;

    let cmd = state
        .repo
        .get_command(&req.command_id)
        .await?
        .ok_or_else(|| ApiError::not_found("command not found"))?;
    if cmd.node_id != node_id {
        return Err(ApiError::validation("command does not belong to node"));
    }

    let force_final = cmd
        .status
        .parse::<CommandStatus>()
        .map(|s| s.is_terminal())
        .unwrap_or(false);

    let mut chunks = Vec::with_capacity(req.chunks.len());
    for chunk in req.chunks {
        chunk
            .stream
            .parse::<StreamKind>()
            .map_err(|_| ApiError::validation(format!("invalid stream: {}", chunk.stream)))?;
        if chunk.chunk_index < 0 {
            return Err(ApiError::validation(format!(
                "invalid chunk_index: {}",
                chunk.chunk_index
            )));
        }
        if chunk.data.is_empty() {
            return Err(ApiError::validation("empty data in chunk"));
        }

        chunks.push(NewLogChunk {
            chunk_index: chunk.chunk_index,
            stream: chunk.stream,
            data: chunk.data,
            encoding: chunk
                .encoding
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "utf-8".to_string()),
            is_final: chunk.is_final || force_final,
        });
    }

    let acked_offsets = state.repo.insert_log_chunks(&req.command_id, &chunks).await?;

    Ok((
        StatusCode::CREATED,
        Json(PushLogsResponse { acked_offsets }),
    ))
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub command_id: String,
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub error_msg: Option<String>,
}

/// Update a command's status on behalf of the owning node.
///
/// The state machine is enforced; terminal states are absorbing, and a
/// terminal transition finalizes every stored chunk of the command.
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StatusRequest>,
) -> Result<Json<OkResponse>> {
    let node_id = node_id_from_headers(&state.jwt, &headers)?;

    Uuid::parse_str(&req.command_id)
        .map_err(|_| ApiError::validation("invalid command_id"))?;
    let status: CommandStatus = req.status.parse()?;

    let cmd = state
        .repo
        .get_command(&req.command_id)
        .await?
        .ok_or_else(|| ApiError::not_found("command not found"))?;
    if cmd.node_id != node_id {
        return Err(ApiError::validation("command does not belong to node"));
    }

    let error_msg = req.error_msg.as_deref().filter(|m| !m.is_empty());
    state
        .repo
        .update_command_status(&req.command_id, status, req.exit_code, error_msg)
        .await?;

    Ok(Json(OkResponse { ok: true }))
}

#[derive(Deserialize)]
pub struct ListParams {
    pub node_id: Option<String>,
    pub limit: Option<String>,
}

#[derive(Serialize)]
pub struct CommandDetailResponse {
    pub command_id: String,
    pub node_id: String,
    pub command_type: String,
    pub payload: Value,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct ListCommandsResponse {
    pub commands: Vec<CommandDetailResponse>,
}

/// Admin view of commands, newest first. `limit` outside `[1, 100]`
/// falls back to 50.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListCommandsResponse>> {
    let limit = params
        .limit
        .as_deref()
        .and_then(|l| l.parse::<i64>().ok())
        .filter(|l| (1..=MAX_LIST_LIMIT).contains(l))
        .unwrap_or(DEFAULT_LIST_LIMIT);

    let commands = state
        .repo
        .list_commands(params.node_id.as_deref(), limit)
        .await?
        .into_iter()
        .map(|cmd| CommandDetailResponse {
            payload: cmd.payload_json(),
            command_id: cmd.command_id,
            node_id: cmd.node_id,
            command_type: cmd.command_type,
            status: cmd.status,
            exit_code: cmd.exit_code,
            error_msg: cmd.error_msg,
            created_at: cmd.created_at.to_rfc3339(),
            updated_at: cmd.updated_at.to_rfc3339(),
        })
        .collect();

    Ok(Json(ListCommandsResponse { commands }))
}

#[derive(Deserialize)]
pub struct GetLogsParams {
    pub after_chunk_index: Option<String>,
}

#[derive(Serialize)]
pub struct LogChunkResponse {
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    pub is_final: bool,
}

#[derive(Serialize)]
pub struct GetLogsResponse {
    pub command_id: String,
    pub logs: Vec<LogChunkResponse>,
}

/// Admin read of a command's log chunks, ordered by
/// `(chunk_index, stream)`. With `after_chunk_index`, only rows strictly
/// beyond it are returned.
pub async fn get_logs(
    State(state): State<AppState>,
    Path(command_id): Path<String>,
    Query(params): Query<GetLogsParams>,
) -> Result<Json<GetLogsResponse>> {
    Uuid::parse_str(&command_id).map_err(|_| ApiError::validation("invalid command_id"))?;

    state
        .repo
        .get_command(&command_id)
        .await?
        .ok_or_else(|| ApiError::not_found("command not found"))?;

    let after = params
        .after_chunk_index
        .as_deref()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v >= 0);

    let logs = state
        .repo
        .get_command_logs(&command_id, after)
        .await?
        .into_iter()
        .map(|row| LogChunkResponse {
            chunk_index: row.chunk_index,
            stream: row.stream,
            data: row.data,
            is_final: row.is_final,
        })
        .collect();

    Ok(Json(GetLogsResponse { command_id, logs }))
}

#[derive(Deserialize)]
pub struct DeleteQueuedParams {
    pub node_id: Option<String>,
}

#[derive(Serialize)]
pub struct DeleteQueuedResponse {
    pub deleted_count: u64,
}

/// Purge queued commands (optionally for one node), cascading their chunks
pub async fn delete_queued(
    State(state): State<AppState>,
    Query(params): Query<DeleteQueuedParams>,
) -> Result<Json<DeleteQueuedResponse>> {
    let deleted_count = state
        .repo
        .delete_queued_commands(params.node_id.as_deref())
        .await?;
    Ok(Json(DeleteQueuedResponse { deleted_count }))
}
