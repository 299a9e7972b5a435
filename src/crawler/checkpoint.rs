//! In-memory checkpoint of a running task
//!
//! Tracks finished keys as sets plus the delta not yet written to storage.
//! Keys outside the task's work matrix are ignored, and a key is never both
//! completed and failed, so `completed + failed <= total` holds at all times.

use crate::state::TaskType;
use crate::storage::{CheckpointDelta, CheckpointMeta, CheckpointRecord, CheckpointSnapshot};
use std::collections::HashSet;

#[derive(Debug)]
pub struct Checkpoint {
    id: String,
    task_type: TaskType,
    snapshot: CheckpointSnapshot,
    matrix: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    pending: CheckpointDelta,
}

impl Checkpoint {
    /// Starts an empty checkpoint over the given matrix keys
    pub fn new(
        id: impl Into<String>,
        task_type: TaskType,
        snapshot: CheckpointSnapshot,
        matrix: HashSet<String>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type,
            snapshot,
            matrix,
            completed: HashSet::new(),
            failed: HashSet::new(),
            pending: CheckpointDelta::default(),
        }
    }

    /// Rebuilds a checkpoint from its stored record
    ///
    /// Stored keys that are not part of `matrix` are dropped.
    pub fn restore(record: CheckpointRecord, matrix: HashSet<String>) -> Self {
        let completed: HashSet<String> = record
            .completed_keys
            .into_iter()
            .filter(|k| matrix.contains(k))
            .collect();
        let failed: HashSet<String> = record
            .failed_keys
            .into_iter()
            .filter(|k| matrix.contains(k) && !completed.contains(k))
            .collect();

        Self {
            id: record.meta.task_id,
            task_type: record.meta.task_type,
            snapshot: record.meta.snapshot,
            matrix,
            completed,
            failed,
            pending: CheckpointDelta::default(),
        }
    }

    pub fn completed_keys(&self) -> &HashSet<String> {
        &self.completed
    }

    pub fn total(&self) -> u64 {
        self.matrix.len() as u64
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.len() as u64
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.len() as u64
    }

    /// Keys that are completed or failed
    pub fn finished_count(&self) -> u64 {
        self.completed_count() + self.failed_count()
    }

    /// Marks a key completed; a previous failure of it is forgotten
    pub fn mark_completed(&mut self, key: String) {
        if !self.matrix.contains(&key) {
            return;
        }
        self.failed.remove(&key);
        if self.completed.insert(key.clone()) {
            self.pending.completed.push(key);
        }
    }

    /// Marks a key failed unless it already completed
    pub fn mark_failed(&mut self, key: String) {
        if !self.matrix.contains(&key) || self.completed.contains(&key) {
            return;
        }
        if self.failed.insert(key.clone()) {
            self.pending.failed.push(key);
        }
    }

    /// Removes and returns the unwritten delta
    pub fn take_delta(&mut self) -> CheckpointDelta {
        std::mem::take(&mut self.pending)
    }

    /// Puts back a delta whose write failed
    pub fn restore_delta(&mut self, delta: CheckpointDelta) {
        self.pending.absorb(delta);
    }

    pub fn snapshot(&self) -> &CheckpointSnapshot {
        &self.snapshot
    }

    pub fn snapshot_mut(&mut self) -> &mut CheckpointSnapshot {
        &mut self.snapshot
    }

    /// Header to store alongside the current delta
    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            task_id: self.id.clone(),
            task_type: self.task_type,
            total_items: self.total(),
            completed_items: self.completed_count(),
            failed_items: self.failed_count(),
            snapshot: self.snapshot.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn snapshot() -> CheckpointSnapshot {
        CheckpointSnapshot {
            anchor_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            regions: vec![],
            date_ranges: vec![],
            output_files: vec![],
            data_bytes: 0,
            stats_bytes: 0,
        }
    }

    fn matrix(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_completed_supersedes_failed() {
        let mut checkpoint =
            Checkpoint::new("t1", TaskType::SearchIndex, snapshot(), matrix(&["a", "b"]));

        checkpoint.mark_failed("a".to_string());
        assert_eq!(checkpoint.failed_count(), 1);

        checkpoint.mark_completed("a".to_string());
        assert_eq!(checkpoint.completed_count(), 1);
        assert_eq!(checkpoint.failed_count(), 0);

        checkpoint.mark_failed("a".to_string());
        assert_eq!(checkpoint.failed_count(), 0);
        assert!(checkpoint.finished_count() <= checkpoint.total());
    }

    #[test]
    fn test_keys_outside_matrix_are_ignored() {
        let mut checkpoint =
            Checkpoint::new("t1", TaskType::SearchIndex, snapshot(), matrix(&["a"]));
        checkpoint.mark_completed("zzz".to_string());
        checkpoint.mark_failed("yyy".to_string());
        assert_eq!(checkpoint.finished_count(), 0);
        assert!(checkpoint.take_delta().is_empty());
    }

    #[test]
    fn test_delta_take_and_restore() {
        let mut checkpoint =
            Checkpoint::new("t1", TaskType::SearchIndex, snapshot(), matrix(&["a", "b", "c"]));
        checkpoint.mark_completed("a".to_string());
        checkpoint.mark_failed("b".to_string());

        let delta = checkpoint.take_delta();
        assert_eq!(delta.len(), 2);
        assert!(checkpoint.take_delta().is_empty());

        checkpoint.mark_completed("c".to_string());
        checkpoint.restore_delta(delta);
        let merged = checkpoint.take_delta();
        assert_eq!(merged.completed, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(merged.failed, vec!["b".to_string()]);
    }

    #[test]
    fn test_restore_filters_foreign_keys() {
        let record = CheckpointRecord {
            meta: CheckpointMeta {
                task_id: "t1".to_string(),
                task_type: TaskType::FeedIndex,
                total_items: 3,
                completed_items: 2,
                failed_items: 1,
                snapshot: snapshot(),
            },
            completed_keys: matrix(&["a", "old"]),
            failed_keys: matrix(&["a", "b"]),
            created_at: Utc::now(),
            last_update: Utc::now(),
        };

        let checkpoint = Checkpoint::restore(record, matrix(&["a", "b", "c"]));
        assert!(checkpoint.completed_keys().contains("a"));
        assert_eq!(checkpoint.completed_count(), 1);
        assert_eq!(checkpoint.failed_count(), 1);
        assert_eq!(checkpoint.meta().total_items, 3);
    }
}
