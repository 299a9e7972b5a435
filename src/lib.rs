//! Index-Harvester: a resumable harvester for an obfuscated, rate-limited index service
//!
//! This crate pulls keyword time series and audience profiles from an upstream that
//! bans over-active sessions. It rotates a pool of session credentials, spreads
//! fetch work over a worker pool, decodes the upstream's substitution cipher, and
//! checkpoints every finished work item so an interrupted task can pick up where it
//! stopped.

pub mod config;
pub mod crawler;
pub mod credential;
pub mod output;
pub mod scheduler;
pub mod state;
pub mod storage;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Main error type for Index-Harvester operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Credential pool error: {0}")]
    Pool(#[from] credential::PoolError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crawler::FetchError),

    #[error("Decryption error: {0}")]
    Decrypt(#[from] crawler::DecryptError),

    #[error("Output error: {0}")]
    Output(#[from] output::OutputError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] scheduler::SchedulerError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
///
/// Covers both the TOML configuration file and task parameters submitted at
/// task creation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),
}

/// Result type alias for Index-Harvester operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Shared handle to the SQLite store used by the pool, engine and scheduler
pub type SharedStorage = Arc<Mutex<storage::SqliteStorage>>;

/// Locks a std mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Re-export commonly used types
pub use config::Config;
pub use credential::{CredentialPool, MemoryCache};
pub use scheduler::TaskScheduler;
pub use state::{TaskParameters, TaskStatus, TaskType};
