//! Shared fixtures for the integration tests

use index_harvester::config::{Config, EngineConfig, PoolConfig, RateLimitConfig, StorageConfig, UpstreamConfig};
use index_harvester::credential::{parse_cookie_string, CredentialPool, MemoryCache};
use index_harvester::crawler::EngineContext;
use index_harvester::scheduler::{TaskRequest, TaskScheduler};
use index_harvester::storage::{SqliteStorage, Storage, TaskRecord};
use index_harvester::SharedStorage;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Cipher key served by the mock: `a` decodes to `1`, `b` to `,`
pub const CIPHER_KEY: &str = "ab1,";

pub struct Harness {
    pub dir: TempDir,
    pub storage: SharedStorage,
    pub pool: Arc<CredentialPool>,
    pub scheduler: Arc<TaskScheduler>,
}

impl Harness {
    /// Builds a scheduler against `base_url` with `workers` workers per task
    pub fn new(base_url: &str, workers: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config {
            pool: PoolConfig {
                wait_timeout_secs: 0,
                ..PoolConfig::default()
            },
            engine: EngineConfig {
                workers,
                keyword_batch_size: 1,
                max_retries: 1,
                ..EngineConfig::default()
            },
            rate_limit: RateLimitConfig {
                min_interval_ms: 0,
                max_interval_ms: 0,
            },
            upstream: UpstreamConfig {
                base_url: base_url.to_string(),
                timeout_secs: 10,
                ..UpstreamConfig::default()
            },
            storage: StorageConfig {
                database_path: dir.path().join("harvest.db").display().to_string(),
                output_dir: dir.path().join("output").display().to_string(),
            },
            ..Config::default()
        };

        let storage: SharedStorage = Arc::new(Mutex::new(
            SqliteStorage::new(&dir.path().join("harvest.db")).expect("Failed to open storage"),
        ));
        let pool = Arc::new(CredentialPool::new(
            storage.clone(),
            Arc::new(MemoryCache::new()),
            &config.pool,
        ));
        let ctx = EngineContext::new(Arc::new(config), storage.clone(), pool.clone())
            .expect("Failed to build engine context");

        Self {
            dir,
            storage,
            pool,
            scheduler: Arc::new(TaskScheduler::new(ctx)),
        }
    }

    pub fn add_credential(&self, id: &str) {
        self.pool
            .add(id, parse_cookie_string(&format!("BDUSS={}-session", id)), None)
            .expect("Failed to add credential");
    }

    pub fn create(&self, request: Value) -> String {
        let request: TaskRequest = serde_json::from_value(request).expect("Bad task request");
        self.scheduler.create(request).expect("Failed to create task")
    }

    pub fn task(&self, id: &str) -> TaskRecord {
        self.storage
            .lock()
            .unwrap()
            .get_task(id)
            .unwrap()
            .expect("task exists")
    }

    /// Runs the scheduler until the queue drains
    pub async fn run_until_idle(&self) {
        tokio::time::timeout(
            Duration::from_secs(30),
            self.scheduler.clone().run(CancellationToken::new(), true),
        )
        .await
        .expect("scheduler did not go idle")
        .expect("scheduler failed");
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dir.path().join("output")
    }
}

/// A successful search-index body with one entry per requested keyword
///
/// The entry carries no keyword field, so the engine matches it to the
/// request by position.
pub fn search_body(cipher: &str) -> Value {
    json!({
        "status": 0,
        "message": 0,
        "data": {
            "uniqid": "u-1",
            "userIndexes": [{
                "all": {"data": cipher},
                "pc": {"data": cipher},
                "wise": {"data": cipher},
            }],
        },
    })
}

pub fn cipher_key_body() -> Value {
    json!({"status": 0, "data": CIPHER_KEY})
}

/// Word parameter the engine sends for a single keyword
pub fn word(keyword: &str) -> String {
    format!(r#"[[{{"name":"{}","wordType":1}}]]"#, keyword)
}

pub fn read_lines(path: &std::path::Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .expect("Failed to read output")
        .lines()
        .map(str::to_string)
        .collect()
}
