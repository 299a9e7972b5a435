use crate::config::types::{
    Config, EngineConfig, PoolConfig, RateLimitConfig, SchedulerConfig, StorageConfig,
    UpstreamConfig,
};
use crate::ConfigError;
use url::Url;

/// Largest keyword batch the upstream accepts in a single request
pub const MAX_KEYWORD_BATCH: usize = 5;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pool_config(&config.pool)?;
    validate_engine_config(&config.engine)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_upstream_config(&config.upstream)?;
    validate_storage_config(&config.storage)?;
    validate_scheduler_config(&config.scheduler)?;
    Ok(())
}

fn validate_pool_config(config: &PoolConfig) -> Result<(), ConfigError> {
    if config.cooldown_secs == 0 {
        return Err(ConfigError::Validation(
            "cooldown-secs must be greater than 0".to_string(),
        ));
    }

    if config.sync_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "sync-interval-secs must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine_config(config: &EngineConfig) -> Result<(), ConfigError> {
    if config.workers < 1 || config.workers > 64 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 64, got {}",
            config.workers
        )));
    }

    if config.keyword_batch_size < 1 || config.keyword_batch_size > MAX_KEYWORD_BATCH {
        return Err(ConfigError::Validation(format!(
            "keyword-batch-size must be between 1 and {}, got {}",
            MAX_KEYWORD_BATCH, config.keyword_batch_size
        )));
    }

    if config.flush_every < 1 {
        return Err(ConfigError::Validation(format!(
            "flush-every must be >= 1, got {}",
            config.flush_every
        )));
    }

    if config.flush_interval_secs < 1 {
        return Err(ConfigError::Validation(format!(
            "flush-interval-secs must be >= 1, got {}",
            config.flush_interval_secs
        )));
    }

    if !(0.0..=100.0).contains(&config.progress_percent_step) {
        return Err(ConfigError::Validation(format!(
            "progress-percent-step must be between 0 and 100, got {}",
            config.progress_percent_step
        )));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.min_interval_ms > config.max_interval_ms {
        return Err(ConfigError::Validation(format!(
            "min-interval-ms ({}) must not exceed max-interval-ms ({})",
            config.min_interval_ms, config.max_interval_ms
        )));
    }

    Ok(())
}

fn validate_upstream_config(config: &UpstreamConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base-url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base-url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout-secs must be greater than 0".to_string(),
        ));
    }

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.output_dir.is_empty() {
        return Err(ConfigError::Validation(
            "output-dir cannot be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_tasks < 1 {
        return Err(ConfigError::Validation(format!(
            "max-concurrent-tasks must be >= 1, got {}",
            config.max_concurrent_tasks
        )));
    }

    if config.poll_interval_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "poll-interval-ms must be >= 10ms, got {}ms",
            config.poll_interval_ms
        )));
    }

    Ok(())
}
