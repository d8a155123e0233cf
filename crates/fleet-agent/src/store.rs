//! Local durable store
//!
//! File-backed SQLite store that buffers accepted commands and produced
//! log chunks until the control service acknowledges them. Opened in WAL
//! mode with foreign keys enforced. The chunk table's
//! `(command_id, chunk_index, stream)` uniqueness mirrors the server's
//! idempotency key, so replays are harmless on both ends.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;

use crate::error::Result;

/// Chunk delivery states
pub mod chunk_state {
    pub const PENDING: &str = "pending";
    pub const ACKED: &str = "acked";
    pub const FAILED: &str = "failed";
}

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS node_commands_local (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command_id TEXT UNIQUE NOT NULL,
        command_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        retries INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        exit_code INTEGER,
        error_msg TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_local_commands_status
        ON node_commands_local(status, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS command_logs_local (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        stream TEXT NOT NULL CHECK (stream IN ('stdout','stderr')),
        data TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending'
            CHECK (state IN ('pending','acked','failed')),
        retries INTEGER NOT NULL DEFAULT 0,
        last_try TEXT,
        created_at TEXT NOT NULL,
        UNIQUE(command_id, chunk_index, stream)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_local_logs_state
        ON command_logs_local(state, command_id)
    "#,
];

/// A command mirrored from the control service
#[derive(Debug, Clone, FromRow)]
pub struct LocalCommand {
    pub id: i64,
    pub command_id: String,
    pub command_type: String,
    pub payload: String,
    pub status: String,
    pub retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exit_code: Option<i64>,
    pub error_msg: Option<String>,
}

/// A buffered log chunk awaiting acknowledgement
#[derive(Debug, Clone, FromRow)]
pub struct LocalChunk {
    pub id: i64,
    pub command_id: String,
    pub chunk_index: i64,
    pub stream: String,
    pub data: String,
    pub state: String,
    pub retries: i64,
    pub last_try: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Local durable store
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (and create) the store at the given path
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn in_memory() -> Result<Self> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        for migration in MIGRATIONS {
            sqlx::query(migration).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Accept a command from the control service. A repeat accept of the
    /// same command id is a no-op.
    pub async fn save_command(
        &self,
        command_id: &str,
        command_type: &str,
        payload: &str,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO node_commands_local
                (command_id, command_type, payload, status, created_at, updated_at)
             VALUES (?, ?, ?, 'queued', ?, ?)
             ON CONFLICT(command_id) DO NOTHING",
        )
        .bind(command_id)
        .bind(command_type)
        .bind(payload)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Oldest queued command, if any
    pub async fn next_queued(&self) -> Result<Option<LocalCommand>> {
        let cmd = sqlx::query_as::<_, LocalCommand>(
            "SELECT id, command_id, command_type, payload, status, retries,
                    created_at, updated_at, exit_code, error_msg
             FROM node_commands_local
             WHERE status = 'queued'
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(cmd)
    }

    /// Look up a command by id
    pub async fn get_command(&self, command_id: &str) -> Result<Option<LocalCommand>> {
        let cmd = sqlx::query_as::<_, LocalCommand>(
            "SELECT id, command_id, command_type, payload, status, retries,
                    created_at, updated_at, exit_code, error_msg
             FROM node_commands_local WHERE command_id = ?",
        )
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cmd)
    }

    /// Update a command's local status
    pub async fn update_command_status(
        &self,
        command_id: &str,
        status: &str,
        exit_code: Option<i64>,
        error_msg: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE node_commands_local
             SET status = ?, exit_code = ?, error_msg = ?, updated_at = ?
             WHERE command_id = ?",
        )
        .bind(status)
        .bind(exit_code)
        .bind(error_msg)
        .bind(Utc::now())
        .bind(command_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Buffer a produced chunk in `pending` state; a replay of the same
    /// `(command_id, chunk_index, stream)` key is a no-op.
    pub async fn save_chunk(
        &self,
        command_id: &str,
        chunk_index: i64,
        stream: &str,
        data: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO command_logs_local
                (command_id, chunk_index, stream, data, state, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?)
             ON CONFLICT(command_id, chunk_index, stream) DO NOTHING",
        )
        .bind(command_id)
        .bind(chunk_index)
        .bind(stream)
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending chunks of one command, in push order
    pub async fn pending_chunks(&self, command_id: &str) -> Result<Vec<LocalChunk>> {
        let chunks = sqlx::query_as::<_, LocalChunk>(
            "SELECT id, command_id, chunk_index, stream, data, state, retries,
                    last_try, created_at
             FROM command_logs_local
             WHERE command_id = ? AND state = 'pending'
             ORDER BY chunk_index ASC, stream ASC",
        )
        .bind(command_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chunks)
    }

    /// Distinct commands that still have pending chunks
    pub async fn commands_with_pending_chunks(&self) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT command_id FROM command_logs_local
             WHERE state = 'pending' ORDER BY command_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Mark the given chunk indexes of a command as acked, transactionally
    pub async fn mark_chunks_acked(&self, command_id: &str, chunk_indexes: &[i64]) -> Result<()> {
        if chunk_indexes.is_empty() {
            return Ok(());
        }

        let placeholders = chunk_indexes
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "UPDATE command_logs_local
             SET state = 'acked', last_try = ?
             WHERE command_id = ? AND chunk_index IN ({placeholders})"
        );

        let mut tx = self.pool.begin().await?;
        let mut q = sqlx::query(&query).bind(Utc::now()).bind(command_id);
        for chunk_index in chunk_indexes {
            q = q.bind(chunk_index);
        }
        q.execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bump retry counters for chunks that failed to deliver
    pub async fn increment_chunk_retries(
        &self,
        command_id: &str,
        chunk_indexes: &[i64],
    ) -> Result<()> {
        if chunk_indexes.is_empty() {
            return Ok(());
        }

        let placeholders = chunk_indexes
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(",");
        let query = format!(
            "UPDATE command_logs_local
             SET retries = retries + 1, last_try = ?
             WHERE command_id = ? AND chunk_index IN ({placeholders})"
        );

        let mut q = sqlx::query(&query).bind(Utc::now()).bind(command_id);
        for chunk_index in chunk_indexes {
            q = q.bind(chunk_index);
        }
        q.execute(&self.pool).await?;
        Ok(())
    }

    /// Delete acked chunks older than the given age, transactionally
    pub async fn cleanup_acked_chunks(&self, older_than_minutes: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::minutes(older_than_minutes);

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM command_logs_local WHERE state = 'acked' AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    /// Delete terminal commands older than the given age, transactionally
    pub async fn cleanup_finished_commands(&self, older_than_hours: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::hours(older_than_hours);

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM node_commands_local
             WHERE status IN ('success', 'failed', 'timeout') AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_command_idempotent() {
        let store = LocalStore::in_memory().await.unwrap();
        store.save_command("c1", "RunCommand", "{}").await.unwrap();
        store
            .save_command("c1", "RunCommand", r#"{"cmd":"other"}"#)
            .await
            .unwrap();

        let cmd = store.get_command("c1").await.unwrap().unwrap();
        assert_eq!(cmd.payload, "{}", "repeat accept must not overwrite");
    }

    #[tokio::test]
    async fn test_next_queued_is_oldest() {
        let store = LocalStore::in_memory().await.unwrap();
        store.save_command("c1", "RunCommand", "{}").await.unwrap();
        store.save_command("c2", "RunCommand", "{}").await.unwrap();

        let next = store.next_queued().await.unwrap().unwrap();
        assert_eq!(next.command_id, "c1");

        store
            .update_command_status("c1", "running", None, None)
            .await
            .unwrap();
        let next = store.next_queued().await.unwrap().unwrap();
        assert_eq!(next.command_id, "c2");
    }

    #[tokio::test]
    async fn test_chunk_buffer_flow() {
        let store = LocalStore::in_memory().await.unwrap();
        store.save_command("c1", "RunCommand", "{}").await.unwrap();

        store.save_chunk("c1", 0, "stdout", "a\n").await.unwrap();
        store.save_chunk("c1", 0, "stdout", "dup\n").await.unwrap();
        store.save_chunk("c1", 1, "stdout", "b\n").await.unwrap();
        store.save_chunk("c1", 2, "stderr", "e\n").await.unwrap();

        let pending = store.pending_chunks("c1").await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].data, "a\n", "duplicate insert keeps first write");

        assert_eq!(
            store.commands_with_pending_chunks().await.unwrap(),
            vec!["c1".to_string()]
        );

        store.mark_chunks_acked("c1", &[0, 1]).await.unwrap();
        let pending = store.pending_chunks("c1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].chunk_index, 2);

        store.increment_chunk_retries("c1", &[2]).await.unwrap();
        let pending = store.pending_chunks("c1").await.unwrap();
        assert_eq!(pending[0].retries, 1);
        assert!(pending[0].last_try.is_some());
    }

    #[tokio::test]
    async fn test_cleanups_respect_age() {
        let store = LocalStore::in_memory().await.unwrap();
        store.save_command("c1", "RunCommand", "{}").await.unwrap();
        store.save_chunk("c1", 0, "stdout", "x").await.unwrap();
        store.mark_chunks_acked("c1", &[0]).await.unwrap();
        store
            .update_command_status("c1", "success", Some(0), None)
            .await
            .unwrap();

        // Fresh rows survive.
        assert_eq!(store.cleanup_acked_chunks(15).await.unwrap(), 0);
        assert_eq!(store.cleanup_finished_commands(24).await.unwrap(), 0);

        // Backdate everything past the windows.
        let old = Utc::now() - Duration::days(3);
        sqlx::query("UPDATE command_logs_local SET created_at = ?")
            .bind(old)
            .execute(&store.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE node_commands_local SET created_at = ?")
            .bind(old)
            .execute(&store.pool)
            .await
            .unwrap();

        assert_eq!(store.cleanup_acked_chunks(15).await.unwrap(), 1);
        assert_eq!(store.cleanup_finished_commands(24).await.unwrap(), 1);
    }
}
