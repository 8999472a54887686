use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid cycle_interval_ms: {0}. Must be at least 1")]
    InvalidCycleInterval(u64),

    #[error("Invalid action_timeout_ms: {0}. Must be at least 1")]
    InvalidActionTimeout(u64),

    #[error("Invalid event_channel_capacity: {0}. Must be at least 1")]
    InvalidEventChannelCapacity(usize),

    #[error("Invalid bucket_size: {0}. Must be at least 1")]
    InvalidBucketSize(u64),

    #[error("Invalid refill_interval_ms: {0}. Must be at least 1")]
    InvalidRefillInterval(u64),

    #[error("Invalid backoff configuration: initial_delay_ms ({0}) must not exceed max_delay_ms ({1})")]
    InvalidBackoff(u64, u64),

    #[error("Invalid backoff multiplier: {0}. Must be at least 1.0")]
    InvalidMultiplier(String),

    #[error("Invalid task timeout for {0}: must be at least 1ms")]
    InvalidTaskTimeout(&'static str),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidRotation(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Project config file name
pub const CONFIG_FILE: &str = "convoy.yaml";
/// Optional local overrides, not meant to be committed
pub const LOCAL_CONFIG_FILE: &str = "convoy.local.yaml";
/// Environment variable prefix; nested keys use `__`
pub const ENV_PREFIX: &str = "CONVOY_";

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the current directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `convoy.yaml`
    /// 3. `convoy.local.yaml`
    /// 4. `CONVOY_*` environment variables
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same layering as [`load`](Self::load), with both files looked up in `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join(CONFIG_FILE)))
            .merge(Yaml::file(dir.join(LOCAL_CONFIG_FILE)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, environment still on top
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load config from {}", path.display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let reconciler = &config.reconciler;
        if reconciler.cycle_interval_ms == 0 {
            return Err(ConfigError::InvalidCycleInterval(reconciler.cycle_interval_ms));
        }
        if reconciler.action_timeout_ms == 0 {
            return Err(ConfigError::InvalidActionTimeout(reconciler.action_timeout_ms));
        }
        if reconciler.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidEventChannelCapacity(
                reconciler.event_channel_capacity,
            ));
        }

        if config.rate_limit.bucket_size == 0 {
            return Err(ConfigError::InvalidBucketSize(config.rate_limit.bucket_size));
        }
        if config.rate_limit.refill_interval_ms == 0 {
            return Err(ConfigError::InvalidRefillInterval(config.rate_limit.refill_interval_ms));
        }

        let retry = &config.store_retry;
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::InvalidBackoff(retry.initial_delay_ms, retry.max_delay_ms));
        }
        if retry.multiplier.is_nan() || retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(retry.multiplier.to_string()));
        }

        let timeouts = &config.task_timeouts;
        for (name, value) in [
            ("launched", timeouts.launched_ms),
            ("start_initiated", timeouts.start_initiated_ms),
            ("kill_initiated", timeouts.kill_initiated_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidTaskTimeout(name));
            }
        }

        if config.capacity.refresh_interval_ms == 0 || config.capacity.update_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "capacity intervals must be at least 1ms".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rate_limit.bucket_size, 10);
        assert_eq!(config.rate_limit.refill_interval_ms, 100);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
reconciler:
  cycle_interval_ms: 250
rate_limit:
  bucket_size: 4
store_retry:
  initial_delay_ms: 50
  max_delay_ms: 400
  multiplier: 3.0
task_timeouts:
  launched_ms: 1000
logging:
  level: debug
  format: json
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.reconciler.cycle_interval_ms, 250);
        assert_eq!(config.reconciler.event_channel_capacity, 1024);
        assert_eq!(config.reconciler.action_timeout_ms, 10_000);
        assert_eq!(config.rate_limit.bucket_size, 4);
        assert_eq!(config.rate_limit.refill_interval_ms, 100);
        assert!((config.store_retry.multiplier - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.task_timeouts.launched_ms, 1000);
        assert_eq!(config.task_timeouts.kill_initiated_ms, 300_000);
        assert_eq!(config.logging.format, "json");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_zero_bucket() {
        let mut config = Config::default();
        config.rate_limit.bucket_size = 0;
        assert_eq!(ConfigLoader::validate(&config), Err(ConfigError::InvalidBucketSize(0)));
    }

    #[test]
    fn test_validate_zero_action_timeout() {
        let mut config = Config::default();
        config.reconciler.action_timeout_ms = 0;
        assert_eq!(ConfigLoader::validate(&config), Err(ConfigError::InvalidActionTimeout(0)));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.store_retry.initial_delay_ms = 30_000;
        config.store_retry.max_delay_ms = 10_000;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidBackoff(30_000, 10_000))
        );
    }

    #[test]
    fn test_validate_shrinking_multiplier() {
        let mut config = Config::default();
        config.store_retry.multiplier = 0.5;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.task_timeouts.start_initiated_ms = 0;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTaskTimeout("start_initiated"))
        );
    }

    #[test]
    fn test_validate_invalid_log_settings() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        let mut config = Config::default();
        config.logging.rotation = "weekly".to_string();
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidRotation("weekly".to_string()))
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "rate_limit:\n  bucket_size: 5\nlogging:\n  level: info\n  format: json\n",
        )
        .unwrap();
        fs::write(dir.path().join(LOCAL_CONFIG_FILE), "logging:\n  level: debug\n").unwrap();

        temp_env::with_vars(
            [
                ("CONVOY_RATE_LIMIT__REFILL_INTERVAL_MS", Some("40")),
                ("CONVOY_LOGGING__LEVEL", Some("warn")),
            ],
            || {
                let config = ConfigLoader::load_from_dir(dir.path()).unwrap();
                assert_eq!(config.rate_limit.bucket_size, 5, "Project file value");
                assert_eq!(config.rate_limit.refill_interval_ms, 40, "Environment wins");
                assert_eq!(config.logging.level, "warn", "Environment wins over local file");
                assert_eq!(config.logging.format, "json", "Base value persists");
            },
        );
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "rate_limit:\n  bucket_size: 0\n").unwrap();
        temp_env::with_vars_unset(["CONVOY_RATE_LIMIT__BUCKET_SIZE"], || {
            let err = ConfigLoader::load_from_file(&path).unwrap_err();
            assert!(err.to_string().contains("bucket_size"));
        });
    }
}
