//! Crawl orchestration engine
//!
//! Runs one task: expands its parameters into the work matrix, skips keys the
//! checkpoint already holds, and drains the remaining items with a fixed pool
//! of workers. Each worker leases a credential, passes the rate limiter,
//! fetches, decrypts and transforms an item, then hands the rows back.
//! Buffered rows and the checkpoint are flushed together every `flush-every`
//! keys, on a timer, and once more when the workers stop.
//!
//! Placeholder rows of failed items are held back until the matrix is
//! drained and then written past the committed file length. A resume
//! truncates them away and retries those items, so every key ends up with
//! exactly one row.
//!
//! Locks are always taken in the order io → progress, and the progress lock
//! is released before the storage lock is taken.

use crate::config::Config;
use crate::credential::{CredentialPool, Lease, PoolError};
use crate::crawler::capability::{ItemOutput, TaskCapability};
use crate::crawler::checkpoint::Checkpoint;
use crate::crawler::decrypt::{decrypt_payload, DecryptError};
use crate::crawler::fetcher::{FetchError, UpstreamClient};
use crate::crawler::kinds::capability_for;
use crate::crawler::progress::{percent, ProgressReport, ProgressTracker};
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::work::{matrix_keys, pending_items, WorkItem};
use crate::output::{CommittedLengths, OutputSink};
use crate::state::{Region, TaskParameters};
use crate::storage::{CheckpointSnapshot, Storage, TaskProgress, TaskRecord};
use crate::{lock, HarvestError, SharedStorage};
use chrono::{Local, NaiveDate};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Longest error message stored on a failed task
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

pub const REASON_EXHAUSTED: &str = "all credentials are currently rate-limited";
pub const REASON_PAUSED: &str = "paused by user";
pub const REASON_SHUTDOWN: &str = "interrupted by shutdown";
pub const REASON_PERSISTENCE: &str = "progress could not be persisted; resume to retry";

/// Shared collaborators every engine run uses
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<Config>,
    pub storage: SharedStorage,
    pub pool: Arc<CredentialPool>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
}

impl EngineContext {
    /// Builds the rate limiter and upstream client from `config`
    pub fn new(
        config: Arc<Config>,
        storage: SharedStorage,
        pool: Arc<CredentialPool>,
    ) -> Result<Self, FetchError> {
        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        Ok(Self {
            config,
            storage,
            pool,
            limiter,
            upstream,
        })
    }
}

/// Why a run stopped before draining its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    Exhausted,
    Paused,
    Cancelled,
    Failed,
}

impl StopReason {
    /// When several stops race, the highest rank wins
    fn rank(&self) -> u8 {
        match self {
            Self::Shutdown => 1,
            Self::Exhausted => 2,
            Self::Paused => 3,
            Self::Cancelled => 4,
            Self::Failed => 5,
        }
    }
}

/// Cooperative stop signal for one running task
#[derive(Debug, Default)]
pub struct TaskControl {
    token: CancellationToken,
    reason: Mutex<Option<StopReason>>,
    failure: Mutex<Option<String>>,
}

impl TaskControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the run to stop at the next item boundary
    pub fn stop(&self, reason: StopReason) {
        {
            let mut current = lock(&self.reason);
            if current.map_or(true, |c| reason.rank() > c.rank()) {
                *current = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Stops the run because of an error unrelated to credentials
    pub fn fail(&self, message: impl Into<String>) {
        lock(&self.failure).get_or_insert_with(|| message.into());
        self.stop(StopReason::Failed);
    }

    pub fn reason(&self) -> Option<StopReason> {
        *lock(&self.reason)
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once a stop was requested
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused { reason: String },
    Cancelled,
    Failed { message: String },
}

/// Cuts an error message down to what a task record stores
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Engine for one task type
pub struct Engine {
    ctx: EngineContext,
    capability: Arc<dyn TaskCapability>,
}

impl Engine {
    pub fn new(ctx: EngineContext, capability: Arc<dyn TaskCapability>) -> Self {
        Self { ctx, capability }
    }

    /// Engine with the built-in capability for `task_type`
    pub fn for_type(ctx: EngineContext, task_type: crate::state::TaskType) -> Self {
        let capability = capability_for(task_type, ctx.upstream.clone());
        Self::new(ctx, capability)
    }

    /// Runs `task` until its matrix is drained or `control` stops it
    ///
    /// Progress counters are written to the task record on every flush; the
    /// final status is left to the caller.
    pub async fn run(&self, task: &TaskRecord, control: Arc<TaskControl>) -> RunOutcome {
        match self.execute(task, control).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Task {} failed: {}", task.task_id, e);
                RunOutcome::Failed {
                    message: truncate_message(&e.to_string()),
                }
            }
        }
    }

    async fn execute(
        &self,
        task: &TaskRecord,
        control: Arc<TaskControl>,
    ) -> Result<RunOutcome, HarvestError> {
        let params = task.typed_parameters()?;
        let checkpoint_id = task.checkpoint_id().to_string();
        let stored = lock(&self.ctx.storage).load_checkpoint(&checkpoint_id)?;

        let anchor = stored
            .as_ref()
            .map(|r| r.meta.snapshot.anchor_date)
            .unwrap_or_else(|| Local::now().date_naive());
        let items = self.capability.expand(&params, anchor)?;
        let matrix = matrix_keys(&items);

        let resume = stored.as_ref().map(|r| CommittedLengths {
            data: r.meta.snapshot.data_bytes,
            stats: r.meta.snapshot.stats_bytes,
        });
        let sink = OutputSink::open(
            &self.ctx.config.storage.output_dir(),
            self.capability.task_type(),
            &checkpoint_id,
            self.capability.columns(),
            self.capability.stats_columns(),
            resume,
        )?;

        let mut checkpoint = match stored {
            Some(record) => {
                tracing::info!(
                    "Task {} resumes checkpoint {} ({} completed, {} failed)",
                    task.task_id,
                    checkpoint_id,
                    record.completed_keys.len(),
                    record.failed_keys.len()
                );
                Checkpoint::restore(record, matrix)
            }
            None => Checkpoint::new(
                checkpoint_id.clone(),
                self.capability.task_type(),
                snapshot_for(&params, anchor),
                matrix,
            ),
        };

        let lengths = sink.lengths();
        let paths = sink.paths();
        {
            let snapshot = checkpoint.snapshot_mut();
            snapshot.output_files = paths.clone();
            snapshot.data_bytes = lengths.data;
            snapshot.stats_bytes = lengths.stats;
        }

        let meta = checkpoint.meta();
        {
            let mut storage = lock(&self.ctx.storage);
            storage.save_checkpoint(&meta, &Default::default())?;
            storage.set_task_outputs(&task.task_id, &checkpoint_id, &paths)?;
            storage.update_task_progress(&task.task_id, &progress_of(&checkpoint))?;
        }

        let pending = pending_items(items, checkpoint.completed_keys());
        tracing::info!(
            "Task {} ({}): {} keys total, {} items to fetch",
            task.task_id,
            self.capability.task_type(),
            checkpoint.total(),
            pending.len()
        );

        let engine_config = &self.ctx.config.engine;
        let tracker = ProgressTracker::new(
            checkpoint.total(),
            checkpoint.finished_count(),
            engine_config.progress_interval(),
            engine_config.progress_percent_step,
        );
        let workers = engine_config.workers.min(pending.len()).max(1);

        let run = Arc::new(Run {
            task_id: task.task_id.clone(),
            ctx: self.ctx.clone(),
            capability: self.capability.clone(),
            control: control.clone(),
            queue: Mutex::new(pending.into()),
            progress: Mutex::new(Progress {
                checkpoint,
                rows: Vec::new(),
                stats: Vec::new(),
                placeholders: Vec::new(),
                since_flush: 0,
                tracker,
            }),
            io: Mutex::new(sink),
        });

        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(run.clone().flush_ticker(ticker_stop.clone()));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(tokio::spawn(run.clone().work()));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                control.fail(format!("worker panicked: {}", e));
            }
        }

        ticker_stop.cancel();
        let _ = ticker.await;

        let closing = run.clone();
        let persisted = tokio::task::spawn_blocking(move || closing.close_output())
            .await
            .unwrap_or(false);
        if !persisted {
            return Ok(RunOutcome::Paused {
                reason: REASON_PERSISTENCE.to_string(),
            });
        }

        Ok(run.outcome())
    }
}

/// Regions and ranges a run resolved, kept with the checkpoint
fn snapshot_for(params: &TaskParameters, anchor: NaiveDate) -> CheckpointSnapshot {
    let (regions, date_ranges) = match params {
        TaskParameters::SearchIndex(p)
        | TaskParameters::FeedIndex(p)
        | TaskParameters::RegionDistribution(p) => (p.regions.clone(), p.dates.resolve(anchor)),
        TaskParameters::WordGraph(p) => (vec![Region::national()], p.dates.resolve(anchor)),
        TaskParameters::DemographicAttributes(_) | TaskParameters::InterestProfile(_) => {
            (vec![Region::national()], Vec::new())
        }
    };

    CheckpointSnapshot {
        anchor_date: anchor,
        regions,
        date_ranges,
        output_files: Vec::new(),
        data_bytes: 0,
        stats_bytes: 0,
    }
}

fn progress_of(checkpoint: &Checkpoint) -> TaskProgress {
    TaskProgress {
        progress: percent(checkpoint.finished_count(), checkpoint.total()),
        total_items: checkpoint.total(),
        completed_items: checkpoint.completed_count(),
        failed_items: checkpoint.failed_count(),
    }
}

fn log_report(task_id: &str, report: &ProgressReport) {
    let eta = report
        .eta
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!(
        "Task {}: {}/{} keys ({:.1}%), {:.2} keys/s, ETA {}",
        task_id,
        report.finished,
        report.total,
        report.percent,
        report.speed,
        eta
    );
}

/// Item-level failure after a fetch
enum ItemError {
    Fetch(FetchError),
    Decrypt(DecryptError),
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => e.fmt(f),
            Self::Decrypt(e) => e.fmt(f),
        }
    }
}

enum ItemResult {
    Done,
    Requeue,
}

/// Buffered results not yet flushed
struct Progress {
    checkpoint: Checkpoint,
    rows: Vec<Vec<String>>,
    stats: Vec<Vec<String>>,
    /// Output of failed items, written only once the matrix is drained
    placeholders: Vec<ItemOutput>,
    since_flush: usize,
    tracker: ProgressTracker,
}

/// State shared by the workers of one run
struct Run {
    task_id: String,
    ctx: EngineContext,
    capability: Arc<dyn TaskCapability>,
    control: Arc<TaskControl>,
    queue: Mutex<VecDeque<WorkItem>>,
    progress: Mutex<Progress>,
    io: Mutex<OutputSink>,
}

impl Run {
    async fn work(self: Arc<Self>) {
        loop {
            if self.control.is_stopped() {
                break;
            }
            let Some(item) = lock(&self.queue).pop_front() else {
                break;
            };

            match self.process(&item).await {
                ItemResult::Done => {}
                ItemResult::Requeue => lock(&self.queue).push_front(item),
            }
        }
    }

    async fn process(&self, item: &WorkItem) -> ItemResult {
        let max_retries = self.ctx.config.engine.max_retries;
        let mut attempts = 0u32;

        loop {
            if self.control.is_stopped() {
                return ItemResult::Requeue;
            }

            let lease = match self.ctx.pool.acquire() {
                Ok(lease) => lease,
                Err(PoolError::Exhausted) => {
                    if self.wait_for_credential().await {
                        continue;
                    }
                    if !self.control.is_stopped() {
                        tracing::warn!(
                            "Credential pool exhausted, pausing task {}",
                            self.task_id
                        );
                        self.control.stop(StopReason::Exhausted);
                    }
                    return ItemResult::Requeue;
                }
                Err(e) => {
                    self.control.fail(format!("credential pool error: {}", e));
                    return ItemResult::Requeue;
                }
            };

            tokio::select! {
                _ = self.control.stopped() => return ItemResult::Requeue,
                _ = self.ctx.limiter.wait() => {}
            }

            let fetched = tokio::select! {
                _ = self.control.stopped() => return ItemResult::Requeue,
                result = self.capability.fetch(item, &lease) => result,
            };
            if self.control.is_stopped() {
                return ItemResult::Requeue;
            }

            match self.decode(item, fetched) {
                Ok(output) => {
                    self.record(item, output, true);
                    return ItemResult::Done;
                }
                Err(ItemError::Fetch(FetchError::Rejected { permanent, message })) => {
                    self.reject(&lease, permanent, &message);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > max_retries {
                        tracing::warn!(
                            "Task {}: giving up on {:?} after {} attempts: {}",
                            self.task_id,
                            item.keywords,
                            attempts,
                            e
                        );
                        self.record(item, self.capability.placeholder(item), false);
                        return ItemResult::Done;
                    }
                    tracing::debug!(
                        "Task {}: attempt {} for {:?} failed: {}",
                        self.task_id,
                        attempts,
                        item.keywords,
                        e
                    );
                }
            }
        }
    }

    /// Waits up to `wait-timeout-secs` for a credential; false means pause
    async fn wait_for_credential(&self) -> bool {
        let timeout = self.ctx.config.pool.wait_timeout();
        if timeout.is_zero() {
            return false;
        }
        tokio::select! {
            _ = self.control.stopped() => false,
            available = self.ctx.pool.wait_for_available(timeout) => available,
        }
    }

    fn decode(
        &self,
        item: &WorkItem,
        fetched: Result<crate::crawler::capability::RawPayload, FetchError>,
    ) -> Result<ItemOutput, ItemError> {
        let raw = fetched.map_err(ItemError::Fetch)?;
        let payload =
            decrypt_payload(raw, self.capability.series_len(item)).map_err(ItemError::Decrypt)?;
        self.capability
            .transform(item, payload)
            .map_err(ItemError::Fetch)
    }

    fn reject(&self, lease: &Lease, permanent: bool, message: &str) {
        tracing::warn!(
            "Task {}: credential {} rejected (permanent: {}): {}",
            self.task_id,
            lease.id,
            permanent,
            message
        );
        if let Err(e) = self.ctx.pool.report(&lease.id, false, permanent) {
            tracing::error!("Failed to report credential {}: {}", lease.id, e);
        }
    }

    fn record(&self, item: &WorkItem, output: ItemOutput, success: bool) {
        let flush_due = {
            let mut progress = lock(&self.progress);
            if success {
                progress.rows.extend(output.rows);
                progress.stats.extend(output.stats);
            } else {
                progress.placeholders.push(output);
            }
            for key in item.keys() {
                if success {
                    progress.checkpoint.mark_completed(key);
                } else {
                    progress.checkpoint.mark_failed(key);
                }
            }
            progress.since_flush += item.size();

            let finished = progress.checkpoint.finished_count();
            if let Some(report) = progress.tracker.observe(finished) {
                log_report(&self.task_id, &report);
            }
            progress.since_flush >= self.ctx.config.engine.flush_every
        };

        if flush_due {
            self.flush();
        }
    }

    /// Writes buffered rows, then the checkpoint that covers them
    ///
    /// Returns false if anything stayed unwritten; it is kept for the next try.
    fn flush(&self) -> bool {
        let mut io = lock(&self.io);

        let (rows, stats, delta) = {
            let mut progress = lock(&self.progress);
            progress.since_flush = 0;
            (
                std::mem::take(&mut progress.rows),
                std::mem::take(&mut progress.stats),
                progress.checkpoint.take_delta(),
            )
        };
        if rows.is_empty() && stats.is_empty() && delta.is_empty() {
            return true;
        }

        if let Err(e) = io.append(&rows, &stats) {
            tracing::error!("Task {}: failed to write output: {}", self.task_id, e);
            let mut progress = lock(&self.progress);
            let newer_rows = std::mem::replace(&mut progress.rows, rows);
            progress.rows.extend(newer_rows);
            let newer_stats = std::mem::replace(&mut progress.stats, stats);
            progress.stats.extend(newer_stats);
            progress.checkpoint.restore_delta(delta);
            drop(progress);
            self.task_log("error", &format!("failed to write output: {}", e));
            return false;
        }

        let lengths = io.lengths();
        let (meta, task_progress) = {
            let mut progress = lock(&self.progress);
            let snapshot = progress.checkpoint.snapshot_mut();
            snapshot.data_bytes = lengths.data;
            snapshot.stats_bytes = lengths.stats;
            (progress.checkpoint.meta(), progress_of(&progress.checkpoint))
        };

        let saved = {
            let mut storage = lock(&self.ctx.storage);
            storage
                .save_checkpoint(&meta, &delta)
                .and_then(|_| storage.update_task_progress(&self.task_id, &task_progress))
        };

        if let Err(e) = saved {
            tracing::error!("Task {}: failed to save checkpoint: {}", self.task_id, e);
            lock(&self.progress).checkpoint.restore_delta(delta);
            self.task_log("error", &format!("failed to save checkpoint: {}", e));
            return false;
        }

        tracing::debug!(
            "Task {}: flushed {} rows, {} keys",
            self.task_id,
            rows.len(),
            delta.len()
        );
        true
    }

    /// Flushes once more after the workers stopped, retrying a failed write
    fn final_flush(&self) -> bool {
        const ATTEMPTS: usize = 3;
        (0..ATTEMPTS).any(|_| self.flush())
    }

    /// Final flush, then the held-back placeholders if the matrix is drained
    fn close_output(&self) -> bool {
        if !self.final_flush() {
            return false;
        }
        if !self.drained() || self.control.reason() == Some(StopReason::Failed) {
            return true;
        }
        self.write_placeholders()
    }

    /// Appends placeholder rows past the committed lengths
    ///
    /// The checkpoint keeps the lengths of the real rows only, so a resume
    /// cuts these off before it retries the failed keys.
    fn write_placeholders(&self) -> bool {
        let held = std::mem::take(&mut lock(&self.progress).placeholders);
        if held.is_empty() {
            return true;
        }

        let items = held.len();
        let mut rows = Vec::new();
        let mut stats = Vec::new();
        for output in held {
            rows.extend(output.rows);
            stats.extend(output.stats);
        }

        let written = lock(&self.io).append(&rows, &stats);
        match written {
            Ok(()) => {
                tracing::debug!(
                    "Task {}: wrote {} placeholder rows for {} failed items",
                    self.task_id,
                    rows.len(),
                    items
                );
                true
            }
            Err(e) => {
                tracing::error!("Task {}: failed to write placeholders: {}", self.task_id, e);
                self.task_log("error", &format!("failed to write placeholders: {}", e));
                false
            }
        }
    }

    async fn flush_ticker(self: Arc<Self>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.config.engine.flush_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let run = self.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || run.flush()).await {
                        tracing::error!("Task {}: periodic flush aborted: {}", self.task_id, e);
                    }
                }
            }
        }
    }

    /// Every key of the matrix is completed or failed
    fn drained(&self) -> bool {
        let progress = lock(&self.progress);
        lock(&self.queue).is_empty()
            && progress.checkpoint.finished_count() >= progress.checkpoint.total()
    }

    fn outcome(&self) -> RunOutcome {
        let drained = self.drained();

        match self.control.reason() {
            Some(StopReason::Failed) => RunOutcome::Failed {
                message: truncate_message(
                    &self
                        .control
                        .failure()
                        .unwrap_or_else(|| "task failed".to_string()),
                ),
            },
            _ if drained => RunOutcome::Completed,
            Some(StopReason::Cancelled) => RunOutcome::Cancelled,
            Some(StopReason::Paused) => RunOutcome::Paused {
                reason: REASON_PAUSED.to_string(),
            },
            Some(StopReason::Exhausted) => RunOutcome::Paused {
                reason: REASON_EXHAUSTED.to_string(),
            },
            Some(StopReason::Shutdown) => RunOutcome::Paused {
                reason: REASON_SHUTDOWN.to_string(),
            },
            None => RunOutcome::Completed,
        }
    }

    fn task_log(&self, level: &str, message: &str) {
        if let Err(e) = lock(&self.ctx.storage).append_task_log(&self.task_id, level, message) {
            tracing::error!("Task {}: failed to append log: {}", self.task_id, e);
        }
    }
}
