//! Configuration module for Index-Harvester
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use index_harvester::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvester.toml")).unwrap();
//! println!("Temporary bans last {}s", config.pool.cooldown_secs);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, EngineConfig, PoolConfig, RateLimitConfig, SchedulerConfig, StorageConfig,
    UpstreamConfig,
};
pub use validation::MAX_KEYWORD_BATCH;

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
