//! Layered configuration loading: defaults, YAML file, then environment.

use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::CoherenceConfig;

/// Directory holding project-local configuration files.
pub const CONFIG_DIR: &str = ".coherence";
/// Prefix of environment variable overrides. `__` separates nested keys.
pub const ENV_PREFIX: &str = "COHERENCE_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid TTL bounds: min_ttl_secs ({0}) must be positive and not exceed max_ttl_secs ({1})")]
    InvalidTtlBounds(u64, u64),

    #[error("Invalid load thresholds: low ({0}) must be below high ({1}), both within 0..=1")]
    InvalidLoadThresholds(f64, f64),

    #[error("Invalid max_retries: {0}. Cannot be 0")]
    InvalidMaxRetries(u32),

    #[error("Invalid backoff configuration: backoff_base_ms ({0}) must be positive and below backoff_max_ms ({1})")]
    InvalidBackoff(u64, u64),

    #[error("Invalid jitter: {0}. Must be between 0 and 1")]
    InvalidJitter(f64),

    #[error("Invalid lock_ttl_ms: {0}. Must be positive")]
    InvalidLockTtl(u64),

    #[error("Invalid handler_timeout_ms: {0}. Must be positive")]
    InvalidHandlerTimeout(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Invalid max_connections: {0}. Must be at least 1")]
    InvalidMaxConnections(u32),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration relative to the working directory.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. .coherence/config.yaml
    /// 3. .coherence/local.yaml (optional local overrides)
    /// 4. Environment variables (COHERENCE_* prefix)
    pub fn load() -> Result<CoherenceConfig> {
        Self::load_from_dir(".")
    }

    /// Same as [`load`](Self::load) with `.coherence/` resolved under `root`.
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<CoherenceConfig> {
        let dir = root.as_ref().join(CONFIG_DIR);
        let config: CoherenceConfig = Figment::new()
            .merge(Serialized::defaults(CoherenceConfig::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<CoherenceConfig> {
        let config: CoherenceConfig = Figment::new()
            .merge(Serialized::defaults(CoherenceConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!("Failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &CoherenceConfig) -> Result<(), ConfigError> {
        let ttl = &config.ttl;
        if ttl.min_ttl_secs == 0 || ttl.min_ttl_secs > ttl.max_ttl_secs {
            return Err(ConfigError::InvalidTtlBounds(ttl.min_ttl_secs, ttl.max_ttl_secs));
        }
        let thresholds_ok = (0.0..=1.0).contains(&ttl.low_load_threshold)
            && (0.0..=1.0).contains(&ttl.high_load_threshold)
            && ttl.low_load_threshold < ttl.high_load_threshold;
        if !thresholds_ok {
            return Err(ConfigError::InvalidLoadThresholds(ttl.low_load_threshold, ttl.high_load_threshold));
        }
        for (name, value) in [
            ("max_access_multiplier", ttl.max_access_multiplier),
            ("max_load_multiplier", ttl.max_load_multiplier),
            ("max_predictive_multiplier", ttl.max_predictive_multiplier),
        ] {
            if value.is_nan() || value < 1.0 {
                return Err(ConfigError::ValidationFailed(format!("ttl.{name} must be at least 1, got {value}")));
            }
        }
        for (name, value) in [
            ("min_load_multiplier", ttl.min_load_multiplier),
            ("stale_penalty", ttl.stale_penalty),
        ] {
            if value.is_nan() || value <= 0.0 || value > 1.0 {
                return Err(ConfigError::ValidationFailed(format!("ttl.{name} must be in (0, 1], got {value}")));
            }
        }

        let concurrency = &config.concurrency;
        if concurrency.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(concurrency.max_retries));
        }
        if concurrency.backoff_base_ms == 0 || concurrency.backoff_base_ms >= concurrency.backoff_max_ms {
            return Err(ConfigError::InvalidBackoff(concurrency.backoff_base_ms, concurrency.backoff_max_ms));
        }
        if !(0.0..=1.0).contains(&concurrency.jitter) {
            return Err(ConfigError::InvalidJitter(concurrency.jitter));
        }
        if concurrency.lock_ttl_ms == 0 {
            return Err(ConfigError::InvalidLockTtl(concurrency.lock_ttl_ms));
        }

        let threshold = config.invalidation.high_frequency_threshold;
        if !(threshold.is_finite() && threshold >= 0.0) {
            return Err(ConfigError::ValidationFailed(format!(
                "invalidation.high_frequency_threshold must be a non-negative number, got {threshold}"
            )));
        }

        if config.dispatcher.handler_timeout_ms == 0 {
            return Err(ConfigError::InvalidHandlerTimeout(config.dispatcher.handler_timeout_ms));
        }

        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.database.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections(config.database.max_connections));
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
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        Ok(())
    }
}
