//! Repository layer for database operations

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::models::{AgentMetadataRow, CommandRow, LogChunkRow, NewLogChunk, NodeRow};
use crate::{DbError, DbPool, Result};
use fleet_core::CommandStatus;

/// Control-plane repository
#[derive(Debug, Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a node, or refresh it if it already exists.
    ///
    /// Attributes are overwritten and `last_seen_at` refreshed, so
    /// re-registration is an idempotent upsert.
    pub async fn register_node(&self, node_id: &str, attrs: &serde_json::Value) -> Result<()> {
        let attrs_json = serde_json::to_string(attrs)
            .map_err(|e| DbError::validation(format!("invalid attrs: {e}")))?;

        sqlx::query(
            "INSERT INTO nodes (node_id, attrs, last_seen_at) VALUES (?, ?, ?)
             ON CONFLICT(node_id) DO UPDATE SET
                attrs = excluded.attrs,
                last_seen_at = excluded.last_seen_at",
        )
        .bind(node_id)
        .bind(&attrs_json)
        .bind(Utc::now())
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Refresh a node's last_seen_at. Returns false when the node row is missing.
    pub async fn touch_node(&self, node_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE nodes SET last_seen_at = ? WHERE node_id = ?")
            .bind(Utc::now())
            .bind(node_id)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get a node by its node_id
    pub async fn get_node(&self, node_id: &str) -> Result<Option<NodeRow>> {
        let node = sqlx::query_as::<_, NodeRow>(
            "SELECT id, node_id, attrs, last_seen_at, disabled FROM nodes WHERE node_id = ?",
        )
        .bind(node_id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(node)
    }

    /// List all registered nodes, most recently seen first
    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        let nodes = sqlx::query_as::<_, NodeRow>(
            "SELECT id, node_id, attrs, last_seen_at, disabled FROM nodes
             ORDER BY last_seen_at DESC",
        )
        .fetch_all(self.pool.inner())
        .await?;
        Ok(nodes)
    }

    /// Flip a node's disabled flag
    pub async fn set_node_disabled(&self, node_id: &str, disabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE nodes SET disabled = ? WHERE node_id = ?")
            .bind(disabled)
            .bind(node_id)
            .execute(self.pool.inner())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("node {node_id}")));
        }
        Ok(())
    }

    /// Create a queued command for a node and return its fresh id
    pub async fn create_command(
        &self,
        node_id: &str,
        command_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid> {
        let command_id = Uuid::new_v4();
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| DbError::validation(format!("invalid payload: {e}")))?;
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO node_commands
                (command_id, node_id, command_type, payload, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'queued', ?, ?)",
        )
        .bind(command_id.to_string())
        .bind(node_id)
        .bind(command_type)
        .bind(&payload_json)
        .bind(now)
        .bind(now)
        .execute(self.pool.inner())
        .await?;

        Ok(command_id)
    }

    /// Lease up to `max` queued commands for a node.
    ///
    /// One conditional update claims the oldest queued rows (created_at,
    /// then insertion id) and flips them to `running`; only rows the update
    /// actually claimed are returned. The single-statement claim is atomic,
    /// so two concurrent pollers can never both receive the same command.
    pub async fn lease_commands(&self, node_id: &str, max: i64) -> Result<Vec<CommandRow>> {
        let mut leased = sqlx::query_as::<_, CommandRow>(
            "UPDATE node_commands SET status = 'running', updated_at = ?
             WHERE status = 'queued' AND command_id IN (
                SELECT command_id FROM node_commands
                WHERE node_id = ? AND status = 'queued'
                ORDER BY created_at ASC, id ASC
                LIMIT ?)
             RETURNING id, command_id, node_id, command_type, payload, status,
                       created_at, updated_at, exit_code, error_msg",
        )
        .bind(Utc::now())
        .bind(node_id)
        .bind(max)
        .fetch_all(self.pool.inner())
        .await?;

        leased.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        Ok(leased)
    }

    /// Get a command by its command_id
    pub async fn get_command(&self, command_id: &str) -> Result<Option<CommandRow>> {
        let cmd = sqlx::query_as::<_, CommandRow>(
            "SELECT id, command_id, node_id, command_type, payload, status,
                    created_at, updated_at, exit_code, error_msg
             FROM node_commands WHERE command_id = ?",
        )
        .bind(command_id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(cmd)
    }

    /// List commands, newest first, optionally filtered by node
    pub async fn list_commands(
        &self,
        node_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<CommandRow>> {
        let commands = match node_id {
            Some(node_id) => {
                sqlx::query_as::<_, CommandRow>(
                    "SELECT id, command_id, node_id, command_type, payload, status,
                            created_at, updated_at, exit_code, error_msg
                     FROM node_commands WHERE node_id = ?
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(node_id)
                .bind(limit)
                .fetch_all(self.pool.inner())
                .await?
            }
            None => {
                sqlx::query_as::<_, CommandRow>(
                    "SELECT id, command_id, node_id, command_type, payload, status,
                            created_at, updated_at, exit_code, error_msg
                     FROM node_commands
                     ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(self.pool.inner())
                .await?
            }
        };
        Ok(commands)
    }

    /// Update a command's status.
    ///
    /// Enforces the state machine (terminal states are absorbing). On a
    /// terminal transition every log chunk of the command is flipped to
    /// `is_final` in the same transaction, so a reader that observes any
    /// final chunk can stop streaming without consulting status.
    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
        exit_code: Option<i64>,
        error_msg: Option<&str>,
    ) -> Result<()> {
        // Statuses that may legally precede the requested one; the update is
        // a compare-and-swap against this set.
        let sources: Vec<&str> = CommandStatus::ALL
            .iter()
            .filter(|s| s.can_transition_to(status))
            .map(CommandStatus::as_str)
            .collect();
        let placeholders = sources.iter().map(|_| "?").collect::<Vec<_>>().join(",");

        let mut tx = self.pool.inner().begin().await?;

        let update = format!(
            "UPDATE node_commands
             SET status = ?, exit_code = ?, error_msg = ?, updated_at = ?
             WHERE command_id = ? AND status IN ({placeholders})"
        );
        let mut q = sqlx::query(&update)
            .bind(status.as_str())
            .bind(exit_code)
            .bind(error_msg)
            .bind(Utc::now())
            .bind(command_id);
        for source in &sources {
            q = q.bind(*source);
        }
        let updated = q.execute(&mut *tx).await?.rows_affected();

        if updated == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM node_commands WHERE command_id = ?")
                    .bind(command_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match current {
                None => Err(DbError::not_found(format!("command {command_id}"))),
                Some(current) => Err(DbError::conflict(format!(
                    "cannot transition command from {current} to {status}"
                ))),
            };
        }

        if status.is_terminal() {
            sqlx::query(
                "UPDATE command_logs SET is_final = 1
                 WHERE command_id = ? AND is_final = 0",
            )
            .bind(command_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Store log chunks, idempotent on `(command_id, chunk_index, stream)`.
    ///
    /// A duplicate key only upgrades `is_final` from false to true; it never
    /// downgrades, and the row count for the key stays one. Returned offsets
    /// are the chunk indexes of rows that were newly inserted or whose
    /// `is_final` was upgraded.
    pub async fn insert_log_chunks(
        &self,
        command_id: &str,
        chunks: &[NewLogChunk],
    ) -> Result<Vec<i64>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.inner().begin().await?;
        let mut acked = Vec::with_capacity(chunks.len());
        let now = Utc::now();

        for chunk in chunks {
            let returned: Option<i64> = sqlx::query_scalar(
                "INSERT INTO command_logs
                    (command_id, chunk_index, stream, data, encoding, is_final, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(command_id, chunk_index, stream) DO UPDATE SET is_final = 1
                 WHERE command_logs.is_final = 0 AND excluded.is_final = 1
                 RETURNING chunk_index",
            )
            .bind(command_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.stream)
            .bind(&chunk.data)
            .bind(&chunk.encoding)
            .bind(chunk.is_final)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(chunk_index) = returned {
                acked.push(chunk_index);
            }
        }

        tx.commit().await?;
        Ok(acked)
    }

    /// Fetch log chunks for a command.
    ///
    /// With `after_chunk_index`, only rows strictly beyond it are returned,
    /// which is what incremental pollers use. Ordering is
    /// `(chunk_index ASC, stream ASC)`.
    pub async fn get_command_logs(
        &self,
        command_id: &str,
        after_chunk_index: Option<i64>,
    ) -> Result<Vec<LogChunkRow>> {
        let rows = match after_chunk_index {
            Some(after) => {
                sqlx::query_as::<_, LogChunkRow>(
                    "SELECT id, command_id, chunk_index, stream, data, encoding, is_final, created_at
                     FROM command_logs
                     WHERE command_id = ? AND chunk_index > ?
                     ORDER BY chunk_index ASC, stream ASC",
                )
                .bind(command_id)
                .bind(after)
                .fetch_all(self.pool.inner())
                .await?
            }
            None => {
                sqlx::query_as::<_, LogChunkRow>(
                    "SELECT id, command_id, chunk_index, stream, data, encoding, is_final, created_at
                     FROM command_logs
                     WHERE command_id = ?
                     ORDER BY chunk_index ASC, stream ASC",
                )
                .bind(command_id)
                .fetch_all(self.pool.inner())
                .await?
            }
        };
        Ok(rows)
    }

    /// Purge queued commands (optionally for one node), cascading their
    /// chunks, inside a single transaction. Returns the number of commands
    /// removed.
    pub async fn delete_queued_commands(&self, node_id: Option<&str>) -> Result<u64> {
        let mut tx = self.pool.inner().begin().await?;

        let deleted = match node_id {
            Some(node_id) => {
                sqlx::query(
                    "DELETE FROM command_logs WHERE command_id IN (
                        SELECT command_id FROM node_commands
                        WHERE status = 'queued' AND node_id = ?)",
                )
                .bind(node_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM node_commands WHERE status = 'queued' AND node_id = ?")
                    .bind(node_id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
            None => {
                sqlx::query(
                    "DELETE FROM command_logs WHERE command_id IN (
                        SELECT command_id FROM node_commands WHERE status = 'queued')",
                )
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM node_commands WHERE status = 'queued'")
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
            }
        };

        tx.commit().await?;
        Ok(deleted)
    }

    /// Upsert collected host facts for a node
    pub async fn upsert_agent_metadata(
        &self,
        node_id: &str,
        metadata: &AgentMetadataRow,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_metadata
                (node_id, os_name, os_version, arch, kernel_version, hostname,
                 ip_address, cpu_cores, memory_mb, disk_gb, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(node_id) DO UPDATE SET
                os_name = excluded.os_name,
                os_version = excluded.os_version,
                arch = excluded.arch,
                kernel_version = excluded.kernel_version,
                hostname = excluded.hostname,
                ip_address = excluded.ip_address,
                cpu_cores = excluded.cpu_cores,
                memory_mb = excluded.memory_mb,
                disk_gb = excluded.disk_gb,
                last_updated = excluded.last_updated",
        )
        .bind(node_id)
        .bind(&metadata.os_name)
        .bind(&metadata.os_version)
        .bind(&metadata.arch)
        .bind(&metadata.kernel_version)
        .bind(&metadata.hostname)
        .bind(&metadata.ip_address)
        .bind(metadata.cpu_cores)
        .bind(metadata.memory_mb)
        .bind(metadata.disk_gb)
        .bind(Utc::now())
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Delete log chunks older than the retention window
    pub async fn cleanup_old_logs(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let result = sqlx::query("DELETE FROM command_logs WHERE created_at < ?")
            .bind(cutoff)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected())
    }
}
