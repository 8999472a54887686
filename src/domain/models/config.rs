use serde::{Deserialize, Serialize};

/// Main configuration structure for Convoy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Reconciliation loop configuration
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// New task rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Store write retry configuration
    #[serde(default)]
    pub store_retry: RetryConfig,

    /// Per-state task timeouts
    #[serde(default)]
    pub task_timeouts: TaskTimeoutConfig,

    /// Capacity refresh configuration
    #[serde(default)]
    pub capacity: CapacityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconcilerConfig {
    /// Interval between reconciliation cycles of a job, in milliseconds
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Capacity of the per-job and aggregate event channels
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Deadline of a single change action; overruns fail the action
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
}

const fn default_cycle_interval_ms() -> u64 {
    100
}

const fn default_action_timeout_ms() -> u64 {
    10_000
}

const fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: default_cycle_interval_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            action_timeout_ms: default_action_timeout_ms(),
        }
    }
}

/// Token bucket configuration for new task creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Maximum number of tokens in the bucket
    #[serde(default = "default_bucket_size")]
    pub bucket_size: u64,

    /// One token is added every `refill_interval_ms`
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,
}

const fn default_bucket_size() -> u64 {
    10
}

const fn default_refill_interval_ms() -> u64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            bucket_size: default_bucket_size(),
            refill_interval_ms: default_refill_interval_ms(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Delay after the first failure, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound of the delay, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied after each consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

const fn default_initial_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// How long a task may stay in an intermediate state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskTimeoutConfig {
    #[serde(default = "default_launched_ms")]
    pub launched_ms: u64,

    #[serde(default = "default_start_initiated_ms")]
    pub start_initiated_ms: u64,

    #[serde(default = "default_kill_initiated_ms")]
    pub kill_initiated_ms: u64,
}

const fn default_launched_ms() -> u64 {
    120_000
}

const fn default_start_initiated_ms() -> u64 {
    600_000
}

const fn default_kill_initiated_ms() -> u64 {
    300_000
}

impl Default for TaskTimeoutConfig {
    fn default() -> Self {
        Self {
            launched_ms: default_launched_ms(),
            start_initiated_ms: default_start_initiated_ms(),
            kill_initiated_ms: default_kill_initiated_ms(),
        }
    }
}

/// Capacity refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CapacityConfig {
    /// Interval between periodic capacity refreshes, in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,

    /// Upper bound on a single refresh, in milliseconds
    #[serde(default = "default_update_timeout_ms")]
    pub update_timeout_ms: u64,
}

const fn default_refresh_interval_ms() -> u64 {
    300_000
}

const fn default_update_timeout_ms() -> u64 {
    30_000
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval_ms(),
            update_timeout_ms: default_update_timeout_ms(),
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

    /// Directory for rolling log files; stderr only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,

    /// File rotation: daily, hourly or never
    #[serde(default = "default_rotation")]
    pub rotation: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
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
