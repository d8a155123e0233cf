//! Database connection pool

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct DbPool(SqlitePool);

impl DbPool {
    /// Connect to the database and run migrations.
    ///
    /// The database is opened in WAL mode with foreign keys enforced and
    /// is created on first open.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to database: {}", url);

        let options = SqliteConnectOptions::from_str(url)
            .map_err(sqlx::Error::from)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        crate::migrations::run_migrations(&pool).await?;

        info!("Database initialized");
        Ok(Self(pool))
    }

    /// Create an in-memory database for testing.
    ///
    /// A single connection keeps the in-memory database alive for the
    /// lifetime of the pool; separate connections would each see their
    /// own empty database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        crate::migrations::run_migrations(&pool).await?;
        Ok(Self(pool))
    }

    /// Get the inner pool
    pub fn inner(&self) -> &SqlitePool {
        &self.0
    }

    /// Close the pool
    pub async fn close(&self) {
        self.0.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_connection() {
        let pool = DbPool::in_memory().await.unwrap();
        assert!(!pool.inner().is_closed());
    }
}
