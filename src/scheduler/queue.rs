//! Priority queue of tasks waiting for dispatch

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// A task waiting to be dispatched
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,

    /// Higher values are dispatched first
    pub priority: i32,

    /// Enqueue order, used to keep equal priorities FIFO
    pub seq: u64,
}

// Higher priority first; among equals the lower sequence number pops first
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

/// Dispatch queue; a task id is queued at most once
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    queued: HashSet<String>,
    next_seq: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a task; returns false if it is already queued
    pub fn push(&mut self, task_id: &str, priority: i32) -> bool {
        if !self.queued.insert(task_id.to_string()) {
            return false;
        }
        self.heap.push(QueuedTask {
            task_id: task_id.to_string(),
            priority,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        true
    }

    /// Pops the highest-priority task that is still queued
    pub fn pop(&mut self) -> Option<QueuedTask> {
        while let Some(task) = self.heap.pop() {
            if self.queued.remove(&task.task_id) {
                return Some(task);
            }
        }
        None
    }

    /// Drops a task from the queue; stale heap entries are skipped on pop
    pub fn remove(&mut self, task_id: &str) -> bool {
        self.queued.remove(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.queued.contains(task_id)
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new();
        queue.push("low", 0);
        queue.push("high-1", 5);
        queue.push("high-2", 5);
        queue.push("mid", 1);

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|t| t.task_id)).collect();
        assert_eq!(order, vec!["high-1", "high-2", "mid", "low"]);
    }

    #[test]
    fn test_no_duplicates() {
        let mut queue = TaskQueue::new();
        assert!(queue.push("a", 0));
        assert!(!queue.push("a", 9));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_removed_task_is_skipped() {
        let mut queue = TaskQueue::new();
        queue.push("a", 1);
        queue.push("b", 0);
        assert!(queue.remove("a"));
        assert!(!queue.contains("a"));
        assert_eq!(queue.pop().map(|t| t.task_id), Some("b".to_string()));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_after_pop() {
        let mut queue = TaskQueue::new();
        queue.push("a", 0);
        queue.pop();
        assert!(queue.push("a", 0));
        assert_eq!(queue.len(), 1);
    }
}
