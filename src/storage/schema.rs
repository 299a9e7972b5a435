//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Index-Harvester database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Session credentials (durable source of truth for the pool)
CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY,
    fields TEXT NOT NULL,
    is_available INTEGER NOT NULL DEFAULT 1,
    is_permanently_banned INTEGER NOT NULL DEFAULT 0,
    temp_ban_until TEXT,
    expire_time TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_credentials_temp_ban ON credentials(temp_ban_until);

-- Requests made with each credential, per local calendar day
CREATE TABLE IF NOT EXISTS credential_usage (
    credential_id TEXT NOT NULL,
    usage_date TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (credential_id, usage_date)
);

CREATE INDEX IF NOT EXISTS idx_credential_usage_date ON credential_usage(usage_date);

-- Harvest tasks
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    parameters TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    total_items INTEGER NOT NULL DEFAULT 0,
    completed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    checkpoint_ref TEXT,
    output_files TEXT NOT NULL DEFAULT '[]',
    create_time TEXT NOT NULL,
    start_time TEXT,
    update_time TEXT NOT NULL,
    end_time TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

-- Per-task lifecycle log
CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);

-- Checkpoint header, one row per checkpoint
CREATE TABLE IF NOT EXISTS checkpoints (
    task_id TEXT PRIMARY KEY,
    task_type TEXT NOT NULL,
    total_items INTEGER NOT NULL DEFAULT 0,
    completed_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_update TEXT NOT NULL
);

-- Finished work-item keys, written incrementally
CREATE TABLE IF NOT EXISTS checkpoint_items (
    task_id TEXT NOT NULL,
    item_key TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (task_id, item_key)
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_items_status ON checkpoint_items(task_id, status);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
