//! Storage interface for credentials, tasks and checkpoints
//!
//! Checkpoint writes are append-only deltas of finished keys, applied in one
//! transaction together with the snapshot they belong to.

use crate::credential::Credential;
use crate::state::TaskStatus;
use crate::storage::{
    CheckpointDelta, CheckpointMeta, CheckpointRecord, DailyUsage, TaskLogEntry, TaskProgress,
    TaskRecord,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Task {task_id} is {from}; it cannot become {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This trait defines all database operations needed by the pool, the engine
/// and the scheduler. Callers share one backend behind a mutex.
pub trait Storage {
    // ===== Credential Management =====

    /// Inserts a credential, or refreshes fields and expiry of an existing one
    ///
    /// Ban state and usage count of an existing credential are left untouched.
    fn upsert_credential(&mut self, credential: &Credential) -> StorageResult<()>;

    /// Gets a credential by ID
    fn get_credential(&self, id: &str) -> StorageResult<Option<Credential>>;

    /// Lists every credential, ordered by ID
    fn list_credentials(&self) -> StorageResult<Vec<Credential>>;

    /// Overwrites the ban state of a credential
    ///
    /// Returns false if no credential has this ID.
    fn update_credential_state(
        &mut self,
        id: &str,
        is_available: bool,
        is_permanently_banned: bool,
        temp_ban_until: Option<DateTime<Utc>>,
    ) -> StorageResult<bool>;

    /// Raises the stored usage count to `usage` if it is lower
    fn record_credential_usage(&mut self, id: &str, usage: u64) -> StorageResult<()>;

    /// Adds `count` requests to a credential's tally for `day`
    fn add_daily_usage(&mut self, id: &str, day: NaiveDate, count: u64) -> StorageResult<()>;

    /// Daily tallies between `from` and `to` inclusive, oldest first
    ///
    /// With `id`, only that credential's days are returned.
    fn daily_usage(
        &self,
        id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailyUsage>>;

    /// Returns temporarily banned credentials whose cooldown ended by `now` to rotation
    ///
    /// Returns the IDs that were released.
    fn release_expired_bans(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<String>>;

    /// Deletes a credential, returning false if it did not exist
    fn delete_credential(&mut self, id: &str) -> StorageResult<bool>;

    /// Deletes credentials whose expiry time has passed, returning their IDs
    fn delete_expired_credentials(&mut self, now: DateTime<Utc>) -> StorageResult<Vec<String>>;

    // ===== Task Management =====

    /// Inserts a new task
    fn insert_task(&mut self, task: &TaskRecord) -> StorageResult<()>;

    /// Gets a task by ID
    fn get_task(&self, task_id: &str) -> StorageResult<Option<TaskRecord>>;

    /// Lists tasks, newest first, optionally filtered by status
    fn list_tasks(&self, status: Option<TaskStatus>) -> StorageResult<Vec<TaskRecord>>;

    /// Updates task status and error message
    ///
    /// Stamps `start_time` on the first move to running and `end_time` on
    /// any terminal status. A move the lifecycle does not allow, including any
    /// move out of a terminal status, fails with
    /// [`StorageError::InvalidTransition`] and leaves the row untouched.
    fn update_task_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> StorageResult<()>;

    /// Updates progress counters of a task
    fn update_task_progress(&mut self, task_id: &str, progress: &TaskProgress)
        -> StorageResult<()>;

    /// Records the checkpoint a task uses and the files it writes
    fn set_task_outputs(
        &mut self,
        task_id: &str,
        checkpoint_ref: &str,
        output_files: &[String],
    ) -> StorageResult<()>;

    // ===== Task Logs =====

    /// Appends a line to a task's log
    fn append_task_log(&mut self, task_id: &str, level: &str, message: &str)
        -> StorageResult<()>;

    /// Gets the last `limit` log lines of a task, oldest first
    fn task_log_tail(&self, task_id: &str, limit: usize) -> StorageResult<Vec<TaskLogEntry>>;

    // ===== Checkpoint Management =====

    /// Loads a checkpoint with all of its finished keys
    fn load_checkpoint(&self, task_id: &str) -> StorageResult<Option<CheckpointRecord>>;

    /// Writes the checkpoint header and newly finished keys in one transaction
    ///
    /// A key already recorded as completed is never downgraded to failed.
    fn save_checkpoint(&mut self, meta: &CheckpointMeta, delta: &CheckpointDelta)
        -> StorageResult<()>;

    // ===== Statistics =====

    /// Counts tasks by status
    fn count_tasks_by_status(&self) -> StorageResult<HashMap<TaskStatus, u64>>;

    /// Counts checkpoint keys across all tasks as (completed, failed)
    fn count_checkpoint_items(&self) -> StorageResult<(u64, u64)>;
}
