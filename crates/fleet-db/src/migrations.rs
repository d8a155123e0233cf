//! Database migrations

/// Migration version
pub const CURRENT_VERSION: i32 = 1;

/// SQL migrations, one statement per entry
pub const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT UNIQUE NOT NULL,
        attrs TEXT NOT NULL DEFAULT '{}',
        last_seen_at TEXT NOT NULL,
        disabled INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_commands (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command_id TEXT UNIQUE NOT NULL,
        node_id TEXT NOT NULL REFERENCES nodes(node_id),
        command_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        exit_code INTEGER,
        error_msg TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_commands_node_status
        ON node_commands(node_id, status, created_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS command_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        command_id TEXT NOT NULL REFERENCES node_commands(command_id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        stream TEXT NOT NULL CHECK (stream IN ('stdout','stderr')),
        data TEXT NOT NULL,
        encoding TEXT NOT NULL DEFAULT 'utf-8',
        is_final INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE(command_id, chunk_index, stream)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_logs_command ON command_logs(command_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_metadata (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT UNIQUE NOT NULL,
        os_name TEXT,
        os_version TEXT,
        arch TEXT,
        kernel_version TEXT,
        hostname TEXT,
        ip_address TEXT,
        cpu_cores INTEGER,
        memory_mb INTEGER,
        disk_gb INTEGER,
        last_updated TEXT NOT NULL
    )
    "#,
];

/// Run all pending migrations
pub async fn run_migrations(pool: &sqlx::Pool<sqlx::Sqlite>) -> Result<(), sqlx::Error> {
    for (i, migration) in MIGRATIONS.iter().enumerate() {
        tracing::debug!("Running migration {}", i + 1);
        sqlx::query(migration).execute(pool).await?;
    }
    Ok(())
}
