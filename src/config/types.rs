use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for Index-Harvester
///
/// Every section is optional; an empty file yields the defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub engine: EngineConfig,
    #[serde(rename = "rate-limit")]
    pub rate_limit: RateLimitConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
}

/// Credential pool behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How long a temporarily banned credential stays out of rotation (seconds)
    #[serde(rename = "cooldown-secs")]
    pub cooldown_secs: u64,

    /// Interval between durable store / cache reconciliations (seconds)
    #[serde(rename = "sync-interval-secs")]
    pub sync_interval_secs: u64,

    /// Minimum gap between opportunistic cooldown-expiry checks (seconds)
    #[serde(rename = "cooldown-check-interval-secs")]
    pub cooldown_check_interval_secs: u64,

    /// How long a worker waits for a credential before pausing the task (seconds)
    #[serde(rename = "wait-timeout-secs")]
    pub wait_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 1800,
            sync_interval_secs: 600,
            cooldown_check_interval_secs: 300,
            wait_timeout_secs: 0,
        }
    }
}

impl PoolConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn cooldown_check_interval(&self) -> Duration {
        Duration::from_secs(self.cooldown_check_interval_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

/// Engine (per-task worker pool) configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers per running task
    pub workers: usize,

    /// Default number of keywords fetched together in one request
    #[serde(rename = "keyword-batch-size")]
    pub keyword_batch_size: usize,

    /// Flush output and checkpoint after this many finished items
    #[serde(rename = "flush-every")]
    pub flush_every: usize,

    /// Flush output and checkpoint at least this often (seconds)
    #[serde(rename = "flush-interval-secs")]
    pub flush_interval_secs: u64,

    /// Retries for a transient fetch failure before the item is marked failed
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    /// Minimum gap between progress reports (seconds)
    #[serde(rename = "progress-interval-secs")]
    pub progress_interval_secs: u64,

    /// Minimum percent change between progress reports
    #[serde(rename = "progress-percent-step")]
    pub progress_percent_step: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            keyword_batch_size: 5,
            flush_every: 200,
            flush_interval_secs: 30,
            max_retries: 2,
            progress_interval_secs: 5,
            progress_percent_step: 1.0,
        }
    }
}

impl EngineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }
}

/// Global request pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Lower bound of the randomized gap between upstream requests (milliseconds)
    #[serde(rename = "min-interval-ms")]
    pub min_interval_ms: u64,

    /// Upper bound of the randomized gap between upstream requests (milliseconds)
    #[serde(rename = "max-interval-ms")]
    pub max_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1000,
            max_interval_ms: 1500,
        }
    }
}

/// Upstream service connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(rename = "base-url")]
    pub base_url: String,

    #[serde(rename = "user-agent")]
    pub user_agent: String,

    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://index.baidu.com".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            timeout_secs: 15,
            connect_timeout_secs: 10,
        }
    }
}

/// Persistence locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Directory that receives per-task CSV output
    #[serde(rename = "output-dir")]
    pub output_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "./harvester.db".to_string(),
            output_dir: "./output".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }
}

/// Task dispatch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of tasks allowed to run at the same time
    #[serde(rename = "max-concurrent-tasks")]
    pub max_concurrent_tasks: usize,

    /// Dispatch loop wake-up interval (milliseconds)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 2,
            poll_interval_ms: 500,
        }
    }
}
