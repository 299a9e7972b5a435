//! Task scheduler
//!
//! Owns the task lifecycle: creation (with parameter validation), control
//! operations, and dispatch of pending tasks to engine runs, highest priority
//! first and at most `max-concurrent-tasks` at a time.
//!
//! Control operations are idempotent. Asking for a state the task is already
//! in, or is already heading to, is a no-op rather than an error.

mod queue;

pub use queue::{QueuedTask, TaskQueue};

use crate::crawler::{
    truncate_message, Engine, EngineContext, RunOutcome, StopReason, TaskControl,
};
use crate::state::{RawTaskParameters, TaskParameters, TaskStatus, TaskType};
use crate::storage::{Storage, StorageError, TaskLogEntry, TaskRecord};
use crate::{lock, ConfigError};
use chrono::{Local, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Number of log lines returned with a task
pub const LOG_TAIL: usize = 50;

/// Reason stored on tasks found running at start-up
pub const REASON_RESTART: &str = "interrupted by process restart";

/// Errors raised by task control operations
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Cannot {action} task {task_id} while it is {status}")]
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Invalid task: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A task creation request
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRequest {
    pub task_type: TaskType,

    #[serde(default)]
    pub parameters: RawTaskParameters,

    #[serde(default)]
    pub priority: i32,
}

/// A task together with the tail of its log
#[derive(Debug, Clone)]
pub struct TaskView {
    pub task: TaskRecord,
    pub logs: Vec<TaskLogEntry>,
}

/// Result of a control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    NoOp,
}

pub struct TaskScheduler {
    ctx: EngineContext,
    queue: Mutex<TaskQueue>,
    running: Mutex<HashMap<String, Arc<TaskControl>>>,
    wake: Notify,
}

impl TaskScheduler {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            queue: Mutex::new(TaskQueue::new()),
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // ===== Creation and queries =====

    /// Validates and stores a new task, then queues it
    ///
    /// A request that fails validation is still stored, as a failed task, so
    /// the rejection is visible in task listings.
    pub fn create(&self, request: TaskRequest) -> Result<String, SchedulerError> {
        let task_id = uuid::Uuid::new_v4().simple().to_string();

        let (validated, checkpoint_ref) = match self.resolve_request(&request) {
            Ok(resolved) => resolved,
            Err(e) => {
                let mut task = TaskRecord::new(
                    &task_id,
                    request.task_type,
                    serde_json::to_value(&request.parameters).unwrap_or_default(),
                    request.priority,
                );
                task.status = TaskStatus::Failed;
                task.end_time = Some(Utc::now());
                task.error_message = Some(e.to_string());

                let mut storage = lock(&self.ctx.storage);
                storage.insert_task(&task)?;
                storage.append_task_log(&task_id, "error", &format!("rejected: {}", e))?;
                tracing::warn!("Rejected task {}: {}", task_id, e);
                return Err(e);
            }
        };

        let parameters = serde_json::to_value(&validated).map_err(StorageError::from)?;
        let mut task = TaskRecord::new(&task_id, request.task_type, parameters, request.priority);
        task.checkpoint_ref = checkpoint_ref.clone();

        {
            let mut storage = lock(&self.ctx.storage);
            storage.insert_task(&task)?;
            let message = match &checkpoint_ref {
                Some(from) => format!("created; resumes checkpoint {}", from),
                None => "created".to_string(),
            };
            storage.append_task_log(&task_id, "info", &message)?;
        }

        tracing::info!(
            "Created {} task {} (priority {})",
            request.task_type,
            task_id,
            request.priority
        );
        self.enqueue(&task_id, request.priority);
        Ok(task_id)
    }

    /// Validates parameters and, for resume requests, finds the checkpoint
    fn resolve_request(
        &self,
        request: &TaskRequest,
    ) -> Result<(TaskParameters, Option<String>), SchedulerError> {
        let raw = &request.parameters;
        let today = Local::now().date_naive();
        let default_batch = self.ctx.config.engine.keyword_batch_size;

        if !raw.resume {
            let params = TaskParameters::validate(request.task_type, raw, default_batch, today)?;
            return Ok((params, None));
        }

        let previous_id = raw.task_id.as_deref().map(str::trim).unwrap_or_default();
        if previous_id.is_empty() {
            return Err(ConfigError::InvalidParameters(
                "resume requires the task_id of the task to continue".to_string(),
            )
            .into());
        }
        let previous = lock(&self.ctx.storage)
            .get_task(previous_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(previous_id.to_string()))?;

        if previous.task_type != request.task_type {
            return Err(ConfigError::InvalidParameters(format!(
                "task {} is a {} task, not {}",
                previous_id, previous.task_type, request.task_type
            ))
            .into());
        }

        let params = if raw.keywords.is_empty() {
            previous.typed_parameters()?
        } else {
            TaskParameters::validate(request.task_type, raw, default_batch, today)?
        };
        Ok((params, Some(previous.checkpoint_id().to_string())))
    }

    pub fn get(&self, task_id: &str) -> Result<TaskView, SchedulerError> {
        let storage = lock(&self.ctx.storage);
        let task = storage
            .get_task(task_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        let logs = storage.task_log_tail(task_id, LOG_TAIL)?;
        Ok(TaskView { task, logs })
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<TaskRecord>, SchedulerError> {
        Ok(lock(&self.ctx.storage).list_tasks(status)?)
    }

    /// Ids of tasks with a live engine run in this process
    pub fn running_tasks(&self) -> Vec<String> {
        lock(&self.running).keys().cloned().collect()
    }

    // ===== Control =====

    /// Queues a pending task, or resumes a paused one
    pub fn start(&self, task_id: &str) -> Result<ControlOutcome, SchedulerError> {
        let task = self.load(task_id)?;
        match task.status {
            TaskStatus::Pending => {
                if self.is_running(task_id) {
                    return Ok(ControlOutcome::NoOp);
                }
                let queued = self.enqueue(task_id, task.priority);
                Ok(if queued {
                    ControlOutcome::Applied
                } else {
                    ControlOutcome::NoOp
                })
            }
            TaskStatus::Paused => self.resume(task_id),
            TaskStatus::Running => Ok(ControlOutcome::NoOp),
            status => Err(invalid(task_id, status, "start")),
        }
    }

    /// Stops a task at the next item boundary, keeping it resumable
    pub fn pause(&self, task_id: &str) -> Result<ControlOutcome, SchedulerError> {
        let task = self.load(task_id)?;
        match task.status {
            TaskStatus::Paused => Ok(ControlOutcome::NoOp),
            TaskStatus::Running if self.signal(task_id, StopReason::Paused) => {
                Ok(ControlOutcome::Applied)
            }
            TaskStatus::Pending | TaskStatus::Running => {
                lock(&self.queue).remove(task_id);
                self.set_status(task_id, TaskStatus::Paused, Some(crate::crawler::REASON_PAUSED))?;
                self.log(task_id, "info", "paused by user");
                Ok(ControlOutcome::Applied)
            }
            status => Err(invalid(task_id, status, "pause")),
        }
    }

    /// Re-queues a paused task; its run continues from the checkpoint
    pub fn resume(&self, task_id: &str) -> Result<ControlOutcome, SchedulerError> {
        let task = self.load(task_id)?;
        match task.status {
            TaskStatus::Paused => {
                self.set_status(task_id, TaskStatus::Pending, None)?;
                self.log(task_id, "info", "resumed");
                self.enqueue(task_id, task.priority);
                Ok(ControlOutcome::Applied)
            }
            TaskStatus::Pending | TaskStatus::Running => Ok(ControlOutcome::NoOp),
            status => Err(invalid(task_id, status, "resume")),
        }
    }

    /// Cancels a task; a running task stops at the next item boundary
    pub fn cancel(&self, task_id: &str) -> Result<ControlOutcome, SchedulerError> {
        let task = self.load(task_id)?;
        match task.status {
            TaskStatus::Cancelled => Ok(ControlOutcome::NoOp),
            TaskStatus::Running if self.signal(task_id, StopReason::Cancelled) => {
                Ok(ControlOutcome::Applied)
            }
            TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Running => {
                lock(&self.queue).remove(task_id);
                self.set_status(task_id, TaskStatus::Cancelled, None)?;
                self.log(task_id, "info", "cancelled");
                Ok(ControlOutcome::Applied)
            }
            status => Err(invalid(task_id, status, "cancel")),
        }
    }

    // ===== Dispatch =====

    /// Moves tasks left running by a previous process to paused and queues
    /// every pending task, oldest first
    ///
    /// Returns the number of tasks queued.
    pub fn recover(&self) -> Result<usize, SchedulerError> {
        let (interrupted, pending) = {
            let storage = lock(&self.ctx.storage);
            (
                storage.list_tasks(Some(TaskStatus::Running))?,
                storage.list_tasks(Some(TaskStatus::Pending))?,
            )
        };

        for task in interrupted {
            if self.is_running(&task.task_id) {
                continue;
            }
            tracing::warn!("Task {} was running when the process stopped", task.task_id);
            self.set_status(&task.task_id, TaskStatus::Paused, Some(REASON_RESTART))?;
            self.log(&task.task_id, "warn", &format!("paused: {}", REASON_RESTART));
        }

        let mut queued = 0;
        for task in pending.iter().rev() {
            if !self.is_running(&task.task_id) && self.enqueue(&task.task_id, task.priority) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Dispatches queued tasks until `shutdown` fires
    ///
    /// With `stop_when_idle`, returns once the queue is empty and no task is
    /// running. On shutdown every running task is stopped cooperatively and
    /// flushed before this returns.
    pub async fn run(
        self: Arc<Self>,
        shutdown: CancellationToken,
        stop_when_idle: bool,
    ) -> Result<(), SchedulerError> {
        let queued = self.recover()?;
        tracing::info!("Scheduler started with {} queued task(s)", queued);

        let max_concurrent = self.ctx.config.scheduler.max_concurrent_tasks.max(1);
        let poll = Duration::from_millis(self.ctx.config.scheduler.poll_interval_ms.max(1));
        let mut runs = JoinSet::new();

        loop {
            while runs.len() < max_concurrent {
                let Some(next) = lock(&self.queue).pop() else {
                    break;
                };
                if let Err(e) = self.dispatch(&next.task_id, &mut runs) {
                    tracing::error!("Failed to start task {}: {}", next.task_id, e);
                }
            }

            if stop_when_idle && runs.is_empty() && lock(&self.queue).is_empty() {
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Task run ended abnormally: {}", e);
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        if !runs.is_empty() {
            tracing::info!("Stopping {} running task(s)", runs.len());
            for control in lock(&self.running).values() {
                control.stop(StopReason::Shutdown);
            }
            while runs.join_next().await.is_some() {}
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    fn dispatch(
        self: &Arc<Self>,
        task_id: &str,
        runs: &mut JoinSet<()>,
    ) -> Result<(), SchedulerError> {
        let task = self.load(task_id)?;
        if task.status != TaskStatus::Pending {
            tracing::debug!("Skipping task {} ({})", task_id, task.status);
            return Ok(());
        }

        self.set_status(task_id, TaskStatus::Running, None)?;
        self.log(task_id, "info", "started");

        let control = Arc::new(TaskControl::new());
        lock(&self.running).insert(task_id.to_string(), control.clone());

        let engine = Engine::for_type(self.ctx.clone(), task.task_type);
        let scheduler = Arc::clone(self);
        let task_id = task.task_id.clone();
        runs.spawn(async move {
            let outcome = isolate(async move { engine.run(&task, control).await }).await;
            scheduler.finish(&task_id, outcome);
        });
        Ok(())
    }

    /// Persists how a run ended
    ///
    /// A task that reached a terminal status while the run was winding down,
    /// e.g. cancelled from another process, keeps that status.
    fn finish(&self, task_id: &str, outcome: RunOutcome) {
        lock(&self.running).remove(task_id);

        let (status, message, line) = match &outcome {
            RunOutcome::Completed => (TaskStatus::Completed, None, "completed".to_string()),
            RunOutcome::Paused { reason } => (
                TaskStatus::Paused,
                Some(reason.as_str()),
                format!("paused: {}", reason),
            ),
            RunOutcome::Cancelled => (TaskStatus::Cancelled, None, "cancelled".to_string()),
            RunOutcome::Failed { message } => (
                TaskStatus::Failed,
                Some(message.as_str()),
                format!("failed: {}", message),
            ),
        };

        match self.set_status(task_id, status, message) {
            Ok(()) => {
                let level = match status {
                    TaskStatus::Paused => {
                        tracing::warn!("Task {} {}", task_id, line);
                        "warn"
                    }
                    TaskStatus::Failed => {
                        tracing::error!("Task {} {}", task_id, line);
                        "error"
                    }
                    _ => {
                        tracing::info!("Task {} {}", task_id, line);
                        "info"
                    }
                };
                self.log(task_id, level, &line);
            }
            Err(SchedulerError::Storage(StorageError::InvalidTransition { from, .. })) => {
                tracing::warn!(
                    "Task {} run ended as {} but the task is already {}",
                    task_id,
                    status,
                    from
                );
                self.log(
                    task_id,
                    "warn",
                    &format!("run ended as {} after the task became {}", status, from),
                );
            }
            Err(e) => {
                tracing::error!("Failed to record outcome of task {}: {}", task_id, e);
            }
        }
        self.wake.notify_one();
    }

    // ===== Helpers =====

    fn load(&self, task_id: &str) -> Result<TaskRecord, SchedulerError> {
        lock(&self.ctx.storage)
            .get_task(task_id)?
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))
    }

    fn enqueue(&self, task_id: &str, priority: i32) -> bool {
        let queued = lock(&self.queue).push(task_id, priority);
        if queued {
            self.wake.notify_one();
        }
        queued
    }

    fn is_running(&self, task_id: &str) -> bool {
        lock(&self.running).contains_key(task_id)
    }

    /// Signals a run in this process; false if the task runs elsewhere
    fn signal(&self, task_id: &str, reason: StopReason) -> bool {
        match lock(&self.running).get(task_id) {
            Some(control) => {
                control.stop(reason);
                true
            }
            None => false,
        }
    }

    fn set_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<(), SchedulerError> {
        Ok(lock(&self.ctx.storage).update_task_status(task_id, status, message)?)
    }

    fn log(&self, task_id: &str, level: &str, message: &str) {
        if let Err(e) = lock(&self.ctx.storage).append_task_log(task_id, level, message) {
            tracing::error!("Failed to append log for task {}: {}", task_id, e);
        }
    }
}

/// Runs an engine run on its own task so a panic in it becomes a failed outcome
async fn isolate<F>(run: F) -> RunOutcome
where
    F: Future<Output = RunOutcome> + Send + 'static,
{
    match tokio::spawn(run).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!("Engine run aborted: {}", e);
            RunOutcome::Failed {
                message: truncate_message(&format!("engine run aborted: {}", e)),
            }
        }
    }
}

fn invalid(task_id: &str, status: TaskStatus, action: &'static str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        task_id: task_id.to_string(),
        status,
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credential::{CredentialPool, MemoryCache};
    use crate::storage::SqliteStorage;
    use crate::SharedStorage;

    fn scheduler() -> Arc<TaskScheduler> {
        let storage: SharedStorage = Arc::new(Mutex::new(SqliteStorage::new_in_memory().unwrap()));
        let config = Arc::new(Config::default());
        let pool = Arc::new(CredentialPool::new(
            storage.clone(),
            Arc::new(MemoryCache::new()),
            &config.pool,
        ));
        let ctx = EngineContext::new(config, storage, pool).unwrap();
        Arc::new(TaskScheduler::new(ctx))
    }

    fn request(json: &str) -> TaskRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_create_validates_and_queues() {
        let scheduler = scheduler();
        let id = scheduler
            .create(request(
                r#"{"task_type": "search-index", "parameters": {"keywords": ["a"], "days": 7}, "priority": 3}"#,
            ))
            .unwrap();

        let view = scheduler.get(&id).unwrap();
        assert_eq!(view.task.status, TaskStatus::Pending);
        assert_eq!(view.task.priority, 3);
        assert!(view.task.typed_parameters().is_ok());
        assert_eq!(view.logs.len(), 1);
        assert!(lock(&scheduler.queue).contains(&id));
    }

    #[test]
    fn test_invalid_request_is_stored_as_failed() {
        let scheduler = scheduler();
        let result = scheduler.create(request(
            r#"{"task_type": "feed-index", "parameters": {"keywords": []}}"#,
        ));
        assert!(matches!(result, Err(SchedulerError::Config(_))));

        let failed = scheduler.list(Some(TaskStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error_message.is_some());
        assert!(lock(&scheduler.queue).is_empty());
    }

    #[test]
    fn test_resume_request_points_at_old_checkpoint() {
        let scheduler = scheduler();
        let first = scheduler
            .create(request(
                r#"{"task_type": "word-graph", "parameters": {"keywords": ["a", "b"], "days": 14}}"#,
            ))
            .unwrap();
        scheduler.cancel(&first).unwrap();

        let second = scheduler
            .create(request(&format!(
                r#"{{"task_type": "word-graph", "parameters": {{"resume": true, "task_id": "{}"}}}}"#,
                first
            )))
            .unwrap();

        let task = scheduler.get(&second).unwrap().task;
        assert_eq!(task.checkpoint_ref.as_deref(), Some(first.as_str()));
        assert_eq!(task.typed_parameters().unwrap().keywords(), ["a", "b"]);

        let wrong_type = scheduler.create(request(&format!(
            r#"{{"task_type": "feed-index", "parameters": {{"resume": true, "task_id": "{}"}}}}"#,
            first
        )));
        assert!(wrong_type.is_err());

        let missing = scheduler.create(request(
            r#"{"task_type": "feed-index", "parameters": {"resume": true, "task_id": "nope"}}"#,
        ));
        assert!(matches!(missing, Err(SchedulerError::TaskNotFound(_))));
    }

    #[test]
    fn test_control_operations_are_idempotent() {
        let scheduler = scheduler();
        let id = scheduler
            .create(request(
                r#"{"task_type": "interest-profile", "parameters": {"keywords": ["a"]}}"#,
            ))
            .unwrap();

        assert_eq!(scheduler.start(&id).unwrap(), ControlOutcome::NoOp);
        assert_eq!(scheduler.pause(&id).unwrap(), ControlOutcome::Applied);
        assert_eq!(scheduler.pause(&id).unwrap(), ControlOutcome::NoOp);
        assert!(!lock(&scheduler.queue).contains(&id));

        assert_eq!(scheduler.resume(&id).unwrap(), ControlOutcome::Applied);
        assert_eq!(scheduler.resume(&id).unwrap(), ControlOutcome::NoOp);
        assert!(lock(&scheduler.queue).contains(&id));

        assert_eq!(scheduler.cancel(&id).unwrap(), ControlOutcome::Applied);
        assert_eq!(scheduler.cancel(&id).unwrap(), ControlOutcome::NoOp);
        assert!(matches!(
            scheduler.resume(&id),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.pause("missing"),
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_recover_pauses_interrupted_tasks() {
        let scheduler = scheduler();
        let running = scheduler
            .create(request(
                r#"{"task_type": "demographic-attributes", "parameters": {"keywords": ["a"]}}"#,
            ))
            .unwrap();
        let pending = scheduler
            .create(request(
                r#"{"task_type": "demographic-attributes", "parameters": {"keywords": ["b"]}}"#,
            ))
            .unwrap();
        scheduler
            .set_status(&running, TaskStatus::Running, None)
            .unwrap();
        *lock(&scheduler.queue) = TaskQueue::new();

        assert_eq!(scheduler.recover().unwrap(), 1);

        let task = scheduler.get(&running).unwrap().task;
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.error_message.as_deref(), Some(REASON_RESTART));
        assert!(lock(&scheduler.queue).contains(&pending));
    }

    #[test]
    fn test_terminal_status_survives_late_outcome() {
        let scheduler = scheduler();
        let id = scheduler
            .create(request(
                r#"{"task_type": "search-index", "parameters": {"keywords": ["a"], "days": 3}}"#,
            ))
            .unwrap();
        assert_eq!(scheduler.cancel(&id).unwrap(), ControlOutcome::Applied);

        let write = lock(&scheduler.ctx.storage).update_task_status(
            &id,
            TaskStatus::Completed,
            None,
        );
        assert!(matches!(
            write,
            Err(StorageError::InvalidTransition {
                from: TaskStatus::Cancelled,
                to: TaskStatus::Completed,
                ..
            })
        ));

        // A run in another process that finishes after the cancel
        let other = scheduler
            .create(request(
                r#"{"task_type": "search-index", "parameters": {"keywords": ["b"], "days": 3}}"#,
            ))
            .unwrap();
        scheduler.set_status(&other, TaskStatus::Running, None).unwrap();
        lock(&scheduler.ctx.storage)
            .update_task_status(&other, TaskStatus::Cancelled, None)
            .unwrap();
        scheduler.finish(&other, RunOutcome::Completed);

        for task_id in [&id, &other] {
            assert_eq!(scheduler.get(task_id).unwrap().task.status, TaskStatus::Cancelled);
        }
        let logs = scheduler.get(&other).unwrap().logs;
        assert!(logs
            .iter()
            .any(|l| l.message == "run ended as completed after the task became cancelled"));
    }

    #[test]
    fn test_out_of_range_days_rejected_at_create() {
        let scheduler = scheduler();
        let result = scheduler.create(request(
            r#"{"task_type": "search-index", "parameters": {"keywords": ["a"], "days": 4000000000}}"#,
        ));
        assert!(matches!(result, Err(SchedulerError::Config(_))));
        assert!(lock(&scheduler.queue).is_empty());
        assert_eq!(scheduler.list(Some(TaskStatus::Failed)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_run_fails_the_task() {
        let scheduler = scheduler();
        let id = scheduler
            .create(request(
                r#"{"task_type": "feed-index", "parameters": {"keywords": ["a"], "days": 3}}"#,
            ))
            .unwrap();
        scheduler.set_status(&id, TaskStatus::Running, None).unwrap();
        lock(&scheduler.running).insert(id.clone(), Arc::new(TaskControl::new()));

        let outcome = isolate(async {
            let ranges: Vec<u32> = Vec::new();
            RunOutcome::Failed {
                message: ranges[0].to_string(),
            }
        })
        .await;
        assert!(matches!(
            &outcome,
            RunOutcome::Failed { message } if message.starts_with("engine run aborted")
        ));

        scheduler.finish(&id, outcome);
        let task = scheduler.get(&id).unwrap().task;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.end_time.is_some());
        assert!(scheduler.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_when_idle() {
        let scheduler = scheduler();
        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.clone().run(CancellationToken::new(), true),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(scheduler.running_tasks().is_empty());
    }
}
