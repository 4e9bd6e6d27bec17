//! Configuration model for the coherence subsystem.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::cascade::CascadeRule;
use super::rule::RuleSpec;

/// Main configuration structure for the coherence subsystem
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CoherenceConfig {
    /// TTL clamp, base TTLs and load/prediction tuning
    #[serde(default)]
    pub ttl: TtlConfig,

    /// Retry, backoff and lock settings
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Smart invalidation thresholds plus config-defined rules and cascades
    #[serde(default)]
    pub invalidation: InvalidationConfig,

    /// Handler timeout and dispatch mode
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Durable authoritative store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TTL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TtlConfig {
    /// Base TTL for entity types without a strategy
    #[serde(default = "default_base_ttl_secs")]
    pub default_base_ttl_secs: u64,

    /// Base TTL overrides per entity type
    #[serde(default)]
    pub base_ttl_secs: HashMap<String, u64>,

    #[serde(default = "default_min_ttl_secs")]
    pub min_ttl_secs: u64,

    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Upper bound of the access-frequency multiplier
    #[serde(default = "default_max_access_multiplier")]
    pub max_access_multiplier: f64,

    /// Hours without access after which the stale penalty applies
    #[serde(default = "default_stale_after_hours")]
    pub stale_after_hours: u64,

    #[serde(default = "default_stale_penalty")]
    pub stale_penalty: f64,

    /// System load at or above which TTLs grow
    #[serde(default = "default_high_load_threshold")]
    pub high_load_threshold: f64,

    /// System load at or below which TTLs shrink
    #[serde(default = "default_low_load_threshold")]
    pub low_load_threshold: f64,

    #[serde(default = "default_max_load_multiplier")]
    pub max_load_multiplier: f64,

    #[serde(default = "default_min_load_multiplier")]
    pub min_load_multiplier: f64,

    /// Upper bound of the predictive multiplier
    #[serde(default = "default_max_predictive_multiplier")]
    pub max_predictive_multiplier: f64,
}

const fn default_base_ttl_secs() -> u64 {
    3600
}

const fn default_min_ttl_secs() -> u64 {
    60
}

const fn default_max_ttl_secs() -> u64 {
    86_400
}

const fn default_max_access_multiplier() -> f64 {
    3.0
}

const fn default_stale_after_hours() -> u64 {
    24
}

const fn default_stale_penalty() -> f64 {
    0.5
}

const fn default_high_load_threshold() -> f64 {
    0.8
}

const fn default_low_load_threshold() -> f64 {
    0.3
}

const fn default_max_load_multiplier() -> f64 {
    2.0
}

const fn default_min_load_multiplier() -> f64 {
    0.5
}

const fn default_max_predictive_multiplier() -> f64 {
    2.0
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_base_ttl_secs: default_base_ttl_secs(),
            base_ttl_secs: HashMap::new(),
            min_ttl_secs: default_min_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_access_multiplier: default_max_access_multiplier(),
            stale_after_hours: default_stale_after_hours(),
            stale_penalty: default_stale_penalty(),
            high_load_threshold: default_high_load_threshold(),
            low_load_threshold: default_low_load_threshold(),
            max_load_multiplier: default_max_load_multiplier(),
            min_load_multiplier: default_min_load_multiplier(),
            max_predictive_multiplier: default_max_predictive_multiplier(),
        }
    }
}

impl TtlConfig {
    /// Lower TTL clamp.
    pub fn min_ttl(&self) -> Duration {
        Duration::from_secs(self.min_ttl_secs)
    }

    /// Upper TTL clamp.
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    /// Base TTL for entity types without a strategy.
    pub fn default_base_ttl(&self) -> Duration {
        Duration::from_secs(self.default_base_ttl_secs)
    }
}

/// Concurrency control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConcurrencyConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Randomization factor applied to every backoff interval (0.0-1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Default lock TTL in milliseconds
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base_ms() -> u64 {
    50
}

const fn default_backoff_max_ms() -> u64 {
    2000
}

const fn default_jitter() -> f64 {
    0.5
}

const fn default_lock_ttl_ms() -> u64 {
    30_000
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter: default_jitter(),
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl ConcurrencyConfig {
    /// Default lease length for locks.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }
}

/// Invalidation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InvalidationConfig {
    /// Access frequency at or above which smart invalidation runs immediately
    #[serde(default = "default_high_frequency_threshold")]
    pub high_frequency_threshold: f64,

    /// Delay applied to smart invalidation below the threshold
    #[serde(default = "default_low_frequency_delay_ms")]
    pub low_frequency_delay_ms: u64,

    /// Rules declared in configuration, registered after programmatic ones
    #[serde(default)]
    pub rules: Vec<RuleSpec>,

    #[serde(default)]
    pub cascades: Vec<CascadeRule>,
}

const fn default_high_frequency_threshold() -> f64 {
    100.0
}

const fn default_low_frequency_delay_ms() -> u64 {
    5000
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            high_frequency_threshold: default_high_frequency_threshold(),
            low_frequency_delay_ms: default_low_frequency_delay_ms(),
            rules: vec![],
            cascades: vec![],
        }
    }
}

impl InvalidationConfig {
    /// Delay used by smart invalidation below the frequency threshold.
    pub fn low_frequency_delay(&self) -> Duration {
        Duration::from_millis(self.low_frequency_delay_ms)
    }
}

/// How the dispatcher runs the handlers of one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Handlers run one after another in registration order
    #[default]
    Sequential,
    /// Handlers start in registration order and run in parallel
    Concurrent,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DispatcherConfig {
    /// Per-handler timeout in milliseconds
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    #[serde(default)]
    pub mode: DispatchMode,
}

const fn default_handler_timeout_ms() -> u64 {
    5000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout_ms(),
            mode: DispatchMode::default(),
        }
    }
}

impl DispatcherConfig {
    /// Time each handler gets before it is reported as timed out.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to `SQLite` database file
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".coherence/coherence.db".to_string()
}

const fn default_max_connections() -> u32 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files; stdout only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            rotation: default_rotation(),
        }
    }
}
