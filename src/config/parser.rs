use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Reads, parses and validates a harvester configuration file
///
/// Every key has a default, so a missing section or an empty file is fine;
/// only unreadable files, malformed TOML and out-of-range values fail.
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use index_harvester::config::load_config;
///
/// let config = load_config(Path::new("harvester.toml")).unwrap();
/// println!("Workers per task: {}", config.engine.workers);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    parse_config(&std::fs::read_to_string(path)?)
}

/// Parses and validates configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Hex SHA-256 of a configuration file's bytes
///
/// Logged at start-up so runs can be matched to the settings they used.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    Ok(content_hash(&std::fs::read(path)?))
}

/// Loads a configuration together with the hash of the exact text parsed
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok((config, content_hash(content.as_bytes())))
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_sections_override_defaults() {
        let file = config_file(
            r#"
[pool]
cooldown-secs = 900
sync-interval-secs = 120

[engine]
workers = 3
keyword-batch-size = 2
flush-every = 50

[rate-limit]
min-interval-ms = 200
max-interval-ms = 400

[upstream]
base-url = "http://127.0.0.1:8080"

[storage]
database-path = "./test.db"
output-dir = "./out"
"#,
        );
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.pool.cooldown_secs, 900);
        assert_eq!(config.engine.workers, 3);
        assert_eq!(config.engine.keyword_batch_size, 2);
        assert_eq!(config.rate_limit.max_interval_ms, 400);
        assert_eq!(config.upstream.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.storage.output_dir, "./out");
        assert_eq!(config.engine.max_retries, 2);
        assert_eq!(config.scheduler.max_concurrent_tasks, 2);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.pool.cooldown_secs, 1800);
        assert_eq!(config.pool.wait_timeout_secs, 0);
        assert_eq!(config.engine.workers, 5);
        assert_eq!(config.engine.flush_every, 200);
        assert_eq!(config.rate_limit.min_interval_ms, 1000);
        assert_eq!(config.rate_limit.max_interval_ms, 1500);
    }

    #[test]
    fn test_load_errors_are_classified() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/harvester.toml")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            parse_config("[engine\nworkers = "),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            parse_config("[engine]\nworkers = 0\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_hash_matches_parsed_text() {
        let file = config_file("[engine]\nworkers = 4\n");
        let (config, hash) = load_config_with_hash(file.path()).unwrap();

        assert_eq!(config.engine.workers, 4);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, compute_config_hash(file.path()).unwrap());

        let other = config_file("[engine]\nworkers = 5\n");
        assert_ne!(hash, compute_config_hash(other.path()).unwrap());
    }
}
