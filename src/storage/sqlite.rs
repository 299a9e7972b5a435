//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::credential::{Credential, CredentialFields};
use crate::state::{TaskStatus, TaskType};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    CheckpointDelta, CheckpointMeta, CheckpointRecord, CheckpointSnapshot, DailyUsage,
    TaskLogEntry, TaskProgress, TaskRecord,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;

const CREDENTIAL_COLUMNS: &str = "id, fields, is_available, is_permanently_banned, \
     temp_ban_until, expire_time, usage_count";

const TASK_COLUMNS: &str = "task_id, task_type, parameters, priority, status, progress, \
     total_items, completed_items, failed_items, checkpoint_ref, output_files, create_time, \
     start_time, update_time, end_time, error_message";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(StorageError)` - Failed to open database
    pub fn new(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Several processes (scheduler, CLI control commands) may share the file
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn new_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

/// Fixed-width UTC timestamp, so stored values compare correctly as text
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", value, e)))
}

fn day(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_day(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| conversion_error(idx, format!("bad date '{}': {}", value, e)))
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(idx, &v)).transpose()
}

fn credential_from_row(row: &Row<'_>) -> rusqlite::Result<Credential> {
    let fields_json: String = row.get(1)?;
    let fields: CredentialFields = serde_json::from_str(&fields_json)
        .map_err(|e| conversion_error(1, format!("bad credential fields: {}", e)))?;

    Ok(Credential {
        id: row.get(0)?,
        fields,
        is_available: row.get::<_, i64>(2)? != 0,
        is_permanently_banned: row.get::<_, i64>(3)? != 0,
        temp_ban_until: parse_opt_ts(4, row.get(4)?)?,
        expire_time: parse_opt_ts(5, row.get(5)?)?,
        usage_count: row.get::<_, i64>(6)?.max(0) as u64,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let type_str: String = row.get(1)?;
    let task_type = type_str
        .parse::<TaskType>()
        .map_err(|e| conversion_error(1, e))?;

    let status_str: String = row.get(4)?;
    let status = TaskStatus::from_db_string(&status_str)
        .ok_or_else(|| conversion_error(4, format!("unknown task status '{}'", status_str)))?;

    let parameters_json: String = row.get(2)?;
    let parameters = serde_json::from_str(&parameters_json)
        .map_err(|e| conversion_error(2, format!("bad parameters: {}", e)))?;

    let outputs_json: String = row.get(10)?;
    let output_files = serde_json::from_str(&outputs_json)
        .map_err(|e| conversion_error(10, format!("bad output files: {}", e)))?;

    Ok(TaskRecord {
        task_id: row.get(0)?,
        task_type,
        parameters,
        priority: row.get(3)?,
        status,
        progress: row.get(5)?,
        total_items: row.get::<_, i64>(6)?.max(0) as u64,
        completed_items: row.get::<_, i64>(7)?.max(0) as u64,
        failed_items: row.get::<_, i64>(8)?.max(0) as u64,
        checkpoint_ref: row.get(9)?,
        output_files,
        create_time: parse_ts(11, &row.get::<_, String>(11)?)?,
        start_time: parse_opt_ts(12, row.get(12)?)?,
        update_time: parse_ts(13, &row.get::<_, String>(13)?)?,
        end_time: parse_opt_ts(14, row.get(14)?)?,
        error_message: row.get(15)?,
    })
}

impl Storage for SqliteStorage {
    // ===== Credential Management =====

    fn upsert_credential(&mut self, credential: &Credential) -> StorageResult<()> {
        let now = ts(Utc::now());
        let fields = serde_json::to_string(&credential.fields)?;
        self.conn.execute(
            "INSERT INTO credentials (id, fields, is_available, is_permanently_banned,
             temp_ban_until, expire_time, usage_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO UPDATE SET fields = excluded.fields,
             expire_time = excluded.expire_time, updated_at = excluded.updated_at",
            params![
                credential.id,
                fields,
                credential.is_available as i64,
                credential.is_permanently_banned as i64,
                credential.temp_ban_until.map(ts),
                credential.expire_time.map(ts),
                credential.usage_count as i64,
                now,
            ],
        )?;
        Ok(())
    }

    fn get_credential(&self, id: &str) -> StorageResult<Option<Credential>> {
        let sql = format!("SELECT {} FROM credentials WHERE id = ?1", CREDENTIAL_COLUMNS);
        let credential = self
            .conn
            .query_row(&sql, params![id], credential_from_row)
            .optional()?;
        Ok(credential)
    }

    fn list_credentials(&self) -> StorageResult<Vec<Credential>> {
        let sql = format!("SELECT {} FROM credentials ORDER BY id", CREDENTIAL_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let credentials = stmt
            .query_map([], credential_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(credentials)
    }

    fn update_credential_state(
        &mut self,
        id: &str,
        is_available: bool,
        is_permanently_banned: bool,
        temp_ban_until: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        let changed = self.conn.execute(
            "UPDATE credentials SET is_available = ?2, is_permanently_banned = ?3,
             temp_ban_until = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                id,
                is_available as i64,
                is_permanently_banned as i64,
                temp_ban_until.map(ts),
                ts(Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    }

    fn record_credential_usage(&mut self, id: &str, usage: u64) -> StorageResult<()> {
        self.conn.execute(
            "UPDATE credentials SET usage_count = MAX(usage_count, ?2) WHERE id = ?1",
            params![id, usage as i64],
        )?;
        Ok(())
    }

    fn add_daily_usage(&mut self, id: &str, date: NaiveDate, count: u64) -> StorageResult<()> {
        if count == 0 {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO credential_usage (credential_id, usage_date, count) VALUES (?1, ?2, ?3)
             ON CONFLICT(credential_id, usage_date) DO UPDATE SET count = count + excluded.count",
            params![id, day(date), count as i64],
        )?;
        Ok(())
    }

    fn daily_usage(
        &self,
        id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailyUsage>> {
        let mut stmt = self.conn.prepare(
            "SELECT credential_id, usage_date, count FROM credential_usage
             WHERE usage_date >= ?1 AND usage_date <= ?2 AND (?3 IS NULL OR credential_id = ?3)
             ORDER BY usage_date, credential_id",
        )?;
        let usage = stmt
            .query_map(params![day(from), day(to), id], |row| {
                Ok(DailyUsage {
                    credential_id: row.get(0)?,
                    usage_date: parse_day(1, &row.get::<_, String>(1)?)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(usage)
    }

    fn release_expired_bans(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let now = ts(now);
        let tx = self.conn.transaction()?;
        let released = {
            let mut stmt = tx.prepare(
                "SELECT id FROM credentials WHERE is_permanently_banned = 0
                 AND temp_ban_until IS NOT NULL AND temp_ban_until <= ?1 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![now], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        if !released.is_empty() {
            tx.execute(
                "UPDATE credentials SET is_available = 1, temp_ban_until = NULL, updated_at = ?1
                 WHERE is_permanently_banned = 0
                 AND temp_ban_until IS NOT NULL AND temp_ban_until <= ?1",
                params![now],
            )?;
        }
        tx.commit()?;

        Ok(released)
    }

    fn delete_credential(&mut self, id: &str) -> StorageResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM credentials WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn delete_expired_credentials(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let now = ts(now);
        let tx = self.conn.transaction()?;
        let expired = {
            let mut stmt = tx.prepare(
                "SELECT id FROM credentials WHERE expire_time IS NOT NULL AND expire_time <= ?1
                 ORDER BY id",
            )?;
            let ids = stmt
                .query_map(params![now], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        tx.execute(
            "DELETE FROM credentials WHERE expire_time IS NOT NULL AND expire_time <= ?1",
            params![now],
        )?;
        tx.commit()?;

        Ok(expired)
    }

    // ===== Task Management =====

    fn insert_task(&mut self, task: &TaskRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO tasks (task_id, task_type, parameters, priority, status, progress,
             total_items, completed_items, failed_items, checkpoint_ref, output_files,
             create_time, start_time, update_time, end_time, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                task.task_id,
                task.task_type.as_str(),
                serde_json::to_string(&task.parameters)?,
                task.priority,
                task.status.to_db_string(),
                task.progress,
                task.total_items as i64,
                task.completed_items as i64,
                task.failed_items as i64,
                task.checkpoint_ref,
                serde_json::to_string(&task.output_files)?,
                ts(task.create_time),
                task.start_time.map(ts),
                ts(task.update_time),
                task.end_time.map(ts),
                task.error_message,
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>> {
        let sql = format!("SELECT {} FROM tasks WHERE task_id = ?1", TASK_COLUMNS);
        let task = self
            .conn
            .query_row(&sql, params![task_id], task_from_row)
            .optional()?;
        Ok(task)
    }

    fn list_tasks(&self, status: Option<TaskStatus>) -> StorageResult<Vec<TaskRecord>> {
        let tasks = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY create_time DESC, task_id",
                    TASK_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.to_db_string()], task_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM tasks ORDER BY create_time DESC, task_id",
                    TASK_COLUMNS
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], task_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(tasks)
    }

    fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> StorageResult<()> {
        let now = ts(Utc::now());
        let tx = self.conn.transaction()?;

        let stored: Option<String> = tx
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.ok_or_else(|| StorageError::TaskNotFound(task_id.to_string()))?;
        let current = TaskStatus::from_db_string(&stored).ok_or_else(|| {
            StorageError::Database(format!("task {} has unknown status '{}'", task_id, stored))
        })?;

        // Re-stating a non-terminal status is allowed so its message can change
        let restated = current == status && !current.is_terminal();
        if !restated && !current.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current,
                to: status,
            });
        }

        let changed = tx.execute(
            "UPDATE tasks SET status = ?2, error_message = ?3, update_time = ?4,
             start_time = CASE WHEN ?2 = 'running' AND start_time IS NULL THEN ?4 ELSE start_time END,
             end_time = CASE WHEN ?5 = 1 THEN ?4 ELSE end_time END
             WHERE task_id = ?1 AND status = ?6",
            params![
                task_id,
                status.to_db_string(),
                error_message,
                now,
                status.is_terminal() as i64,
                current.to_db_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::Database(format!(
                "task {} changed status during the update",
                task_id
            )));
        }
        tx.commit()?;
        Ok(())
    }

    fn update_task_progress(
        &mut self,
        task_id: &str,
        progress: &TaskProgress,
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET progress = ?2, total_items = ?3, completed_items = ?4,
             failed_items = ?5, update_time = ?6 WHERE task_id = ?1",
            params![
                task_id,
                progress.progress,
                progress.total_items as i64,
                progress.completed_items as i64,
                progress.failed_items as i64,
                ts(Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    fn set_task_outputs(
        &mut self,
        task_id: &str,
        checkpoint_ref: &str,
        output_files: &[String],
    ) -> StorageResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET checkpoint_ref = ?2, output_files = ?3, update_time = ?4
             WHERE task_id = ?1",
            params![
                task_id,
                checkpoint_ref,
                serde_json::to_string(output_files)?,
                ts(Utc::now()),
            ],
        )?;

        if changed == 0 {
            return Err(StorageError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    // ===== Task Logs =====

    fn append_task_log(
        &mut self,
        task_id: &str,
        level: &str,
        message: &str,
    ) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO task_logs (task_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, level, message, ts(Utc::now())],
        )?;
        Ok(())
    }

    fn task_log_tail(&self, task_id: &str, limit: usize) -> StorageResult<Vec<TaskLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT level, message, created_at FROM task_logs WHERE task_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;

        let mut entries = stmt
            .query_map(params![task_id, limit as i64], |row| {
                Ok(TaskLogEntry {
                    level: row.get(0)?,
                    message: row.get(1)?,
                    created_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        entries.reverse();
        Ok(entries)
    }

    // ===== Checkpoint Management =====

    fn load_checkpoint(&self, task_id: &str) -> StorageResult<Option<CheckpointRecord>> {
        let header = self
            .conn
            .query_row(
                "SELECT task_type, total_items, completed_items, failed_items, snapshot,
                 created_at, last_update FROM checkpoints WHERE task_id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        parse_ts(5, &row.get::<_, String>(5)?)?,
                        parse_ts(6, &row.get::<_, String>(6)?)?,
                    ))
                },
            )
            .optional()?;

        let Some((type_str, total, completed, failed, snapshot_json, created_at, last_update)) =
            header
        else {
            return Ok(None);
        };

        let task_type = type_str
            .parse::<TaskType>()
            .map_err(StorageError::Database)?;
        let snapshot: CheckpointSnapshot = serde_json::from_str(&snapshot_json)?;

        let mut completed_keys = HashSet::new();
        let mut failed_keys = HashSet::new();
        let mut stmt = self
            .conn
            .prepare("SELECT item_key, status FROM checkpoint_items WHERE task_id = ?1")?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, status) = row?;
            match status.as_str() {
                "completed" => {
                    completed_keys.insert(key);
                }
                "failed" => {
                    failed_keys.insert(key);
                }
                other => {
                    return Err(StorageError::Database(format!(
                        "unknown checkpoint item status '{}'",
                        other
                    )))
                }
            }
        }

        Ok(Some(CheckpointRecord {
            meta: CheckpointMeta {
                task_id: task_id.to_string(),
                task_type,
                total_items: total.max(0) as u64,
                completed_items: completed.max(0) as u64,
                failed_items: failed.max(0) as u64,
                snapshot,
            },
            completed_keys,
            failed_keys,
            created_at,
            last_update,
        }))
    }

    fn save_checkpoint(
        &mut self,
        meta: &CheckpointMeta,
        delta: &CheckpointDelta,
    ) -> StorageResult<()> {
        let now = ts(Utc::now());
        let snapshot = serde_json::to_string(&meta.snapshot)?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO checkpoints (task_id, task_type, total_items, completed_items,
             failed_items, snapshot, created_at, last_update)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(task_id) DO UPDATE SET total_items = excluded.total_items,
             completed_items = excluded.completed_items, failed_items = excluded.failed_items,
             snapshot = excluded.snapshot, last_update = excluded.last_update",
            params![
                meta.task_id,
                meta.task_type.as_str(),
                meta.total_items as i64,
                meta.completed_items as i64,
                meta.failed_items as i64,
                snapshot,
                now,
            ],
        )?;

        {
            let mut completed_stmt = tx.prepare(
                "INSERT INTO checkpoint_items (task_id, item_key, status, updated_at)
                 VALUES (?1, ?2, 'completed', ?3)
                 ON CONFLICT(task_id, item_key) DO UPDATE SET status = 'completed',
                 updated_at = excluded.updated_at",
            )?;
            for key in &delta.completed {
                completed_stmt.execute(params![meta.task_id, key, now])?;
            }

            let mut failed_stmt = tx.prepare(
                "INSERT INTO checkpoint_items (task_id, item_key, status, updated_at)
                 VALUES (?1, ?2, 'failed', ?3)
                 ON CONFLICT(task_id, item_key) DO UPDATE SET status = 'failed',
                 updated_at = excluded.updated_at
                 WHERE checkpoint_items.status <> 'completed'",
            )?;
            for key in &delta.failed {
                failed_stmt.execute(params![meta.task_id, key, now])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ===== Statistics =====

    fn count_tasks_by_status(&self) -> StorageResult<HashMap<TaskStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status_str, count) = row?;
            if let Some(status) = TaskStatus::from_db_string(&status_str) {
                counts.insert(status, count as u64);
            }
        }

        Ok(counts)
    }

    fn count_checkpoint_items(&self) -> StorageResult<(u64, u64)> {
        let (completed, failed): (i64, i64) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM checkpoint_items",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((completed as u64, failed as u64))
    }
}
