//! Storage module for persisting harvest state
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Credential persistence (the pool's durable source of truth)
//! - Task records and per-task logs
//! - Incremental checkpoints of finished work items

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::state::{DateRange, Region, TaskParameters, TaskStatus, TaskType};
use crate::ConfigResult;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Initializes or opens a storage database
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// Represents a task in the database
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub task_type: TaskType,
    /// Validated [`TaskParameters`] as JSON, or the raw request if validation failed
    pub parameters: serde_json::Value,
    pub priority: i32,
    pub status: TaskStatus,
    pub progress: f64,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub checkpoint_ref: Option<String>,
    pub output_files: Vec<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TaskRecord {
    /// Creates a pending task record
    pub fn new(
        task_id: impl Into<String>,
        task_type: TaskType,
        parameters: serde_json::Value,
        priority: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            task_type,
            parameters,
            priority,
            status: TaskStatus::Pending,
            progress: 0.0,
            total_items: 0,
            completed_items: 0,
            failed_items: 0,
            checkpoint_ref: None,
            output_files: Vec::new(),
            create_time: now,
            start_time: None,
            update_time: now,
            end_time: None,
            error_message: None,
        }
    }

    /// Decodes the validated parameters stored with this task
    pub fn typed_parameters(&self) -> ConfigResult<TaskParameters> {
        serde_json::from_value(self.parameters.clone()).map_err(|e| {
            crate::ConfigError::InvalidParameters(format!(
                "stored parameters for task {} are not valid: {}",
                self.task_id, e
            ))
        })
    }

    /// Identifier of the checkpoint this task reads and writes
    pub fn checkpoint_id(&self) -> &str {
        self.checkpoint_ref.as_deref().unwrap_or(&self.task_id)
    }
}

/// Counter update written by the engine while a task runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskProgress {
    pub progress: f64,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
}

/// Requests made with one credential on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub credential_id: String,
    pub usage_date: NaiveDate,
    pub count: u64,
}

/// One line of a task's lifecycle log
#[derive(Debug, Clone)]
pub struct TaskLogEntry {
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Engine settings frozen when a checkpoint is first created
///
/// Resuming from this snapshot reproduces the same work matrix and output files
/// even when the resume happens on a later day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    /// Date that rolling windows and year ranges were resolved against
    pub anchor_date: NaiveDate,
    pub regions: Vec<Region>,
    pub date_ranges: Vec<DateRange>,
    pub output_files: Vec<String>,
    /// Committed length of the data file; anything past it is discarded on resume
    pub data_bytes: u64,
    /// Committed length of the stats file
    pub stats_bytes: u64,
}

/// Checkpoint header row
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub task_id: String,
    pub task_type: TaskType,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub snapshot: CheckpointSnapshot,
}

/// Full checkpoint as loaded at resume
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub meta: CheckpointMeta,
    pub completed_keys: HashSet<String>,
    pub failed_keys: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

/// Keys finished since the previous checkpoint write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointDelta {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
}

impl CheckpointDelta {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty() && self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// Folds an unwritten delta back in front of this one
    pub fn absorb(&mut self, mut earlier: CheckpointDelta) {
        earlier.completed.append(&mut self.completed);
        earlier.failed.append(&mut self.failed);
        *self = earlier;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_id_prefers_reference() {
        let mut task = TaskRecord::new(
            "task-b",
            TaskType::SearchIndex,
            serde_json::json!({}),
            0,
        );
        assert_eq!(task.checkpoint_id(), "task-b");

        task.checkpoint_ref = Some("task-a".to_string());
        assert_eq!(task.checkpoint_id(), "task-a");
    }

    #[test]
    fn test_delta_absorb_keeps_everything() {
        let mut current = CheckpointDelta {
            completed: vec!["c2".to_string()],
            failed: vec![],
        };
        current.absorb(CheckpointDelta {
            completed: vec!["c1".to_string()],
            failed: vec!["f1".to_string()],
        });

        assert_eq!(current.completed, vec!["c1", "c2"]);
        assert_eq!(current.failed, vec!["f1"]);
        assert_eq!(current.len(), 3);
    }
}
