//! Engine configuration.
//!
//! Every tunable of the planner, breaker, cache, pool and progress layers in
//! one place, loadable from `FEEDBACK_*` environment variables.

use std::time::Duration;

use crate::error::ConfigError;
use crate::planner::PlannerConfig;
use crate::progress::DEFAULT_HISTORY_WINDOW;
use crate::scheduler::{default_max_workers, PoolConfig};
use crate::scoring::{CacheConfig, CircuitBreakerConfig};

/// Configuration for a [`BatchJobController`](super::BatchJobController).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Planner settings
    /// Scale applied to computed batch sizes.
    pub batch_size_multiplier: f64,
    /// Smallest batch the planner produces.
    pub min_batch_size: usize,
    /// Available memory at which batch sizes are no longer scaled down.
    pub memory_reference_mb: f64,
    /// Longest accepted record, in characters.
    pub max_record_chars: usize,

    // Circuit breaker settings
    /// How long remote scoring stays paused after the circuit opens.
    pub circuit_cooldown: Duration,
    /// Consecutive failures that open the circuit.
    pub circuit_failure_threshold: u32,
    /// Maximum gap between failures counted as consecutive.
    pub circuit_failure_window: Duration,
    /// Per-record remote latency that opens the circuit.
    pub slow_processing_threshold: Duration,

    // Worker pool settings
    pub max_workers: usize,
    pub remote_timeout: Duration,
    /// Batches between memory-reclaim hints.
    pub reclaim_every_batches: usize,

    // Cache settings
    pub cache_max_entries: usize,
    pub cache_max_payload_chars: usize,

    // Progress settings
    /// Throughput samples kept per operation.
    pub history_window: usize,
    /// Upper bound on one sink publish.
    pub publish_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_multiplier: 1.0,
            min_batch_size: 50,
            memory_reference_mb: 1000.0,
            max_record_chars: 100_000,

            circuit_cooldown: Duration::from_secs(300),
            circuit_failure_threshold: 5,
            circuit_failure_window: Duration::from_secs(60),
            slow_processing_threshold: Duration::from_secs(5),

            max_workers: default_max_workers(),
            remote_timeout: Duration::from_secs(30),
            reclaim_every_batches: 5,

            cache_max_entries: 10_000,
            cache_max_payload_chars: 5000,

            history_window: DEFAULT_HISTORY_WINDOW,
            publish_timeout: Duration::from_millis(1000),
        }
    }
}

impl EngineConfig {
    /// Creates configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FEEDBACK_BATCH_SIZE_MULTIPLIER` (default: 1.0)
    /// - `FEEDBACK_MIN_BATCH_SIZE` (default: 50)
    /// - `FEEDBACK_MEMORY_REFERENCE_MB` (default: 1000)
    /// - `FEEDBACK_MAX_RECORD_CHARS` (default: 100000)
    /// - `FEEDBACK_CIRCUIT_COOLDOWN_SECS` (default: 300)
    /// - `FEEDBACK_CIRCUIT_FAILURE_THRESHOLD` (default: 5)
    /// - `FEEDBACK_CIRCUIT_FAILURE_WINDOW_SECS` (default: 60)
    /// - `FEEDBACK_SLOW_PROCESSING_THRESHOLD_SECS` (default: 5)
    /// - `FEEDBACK_MAX_WORKERS` (default: CPU count x 2)
    /// - `FEEDBACK_REMOTE_TIMEOUT_SECS` (default: 30)
    /// - `FEEDBACK_RECLAIM_EVERY_BATCHES` (default: 5)
    /// - `FEEDBACK_CACHE_MAX_ENTRIES` (default: 10000)
    /// - `FEEDBACK_CACHE_MAX_PAYLOAD_CHARS` (default: 5000)
    /// - `FEEDBACK_HISTORY_WINDOW` (default: 200)
    /// - `FEEDBACK_PUBLISH_TIMEOUT_MS` (default: 1000)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Planner settings
        if let Some(val) = lookup("FEEDBACK_BATCH_SIZE_MULTIPLIER") {
            config.batch_size_multiplier =
                parse_env_value(&val, "FEEDBACK_BATCH_SIZE_MULTIPLIER")?;
        }

        if let Some(val) = lookup("FEEDBACK_MIN_BATCH_SIZE") {
            config.min_batch_size = parse_env_value(&val, "FEEDBACK_MIN_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("FEEDBACK_MEMORY_REFERENCE_MB") {
            config.memory_reference_mb = parse_env_value(&val, "FEEDBACK_MEMORY_REFERENCE_MB")?;
        }

        if let Some(val) = lookup("FEEDBACK_MAX_RECORD_CHARS") {
            config.max_record_chars = parse_env_value(&val, "FEEDBACK_MAX_RECORD_CHARS")?;
        }

        // Circuit breaker settings
        if let Some(val) = lookup("FEEDBACK_CIRCUIT_COOLDOWN_SECS") {
            let secs: u64 = parse_env_value(&val, "FEEDBACK_CIRCUIT_COOLDOWN_SECS")?;
            config.circuit_cooldown = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FEEDBACK_CIRCUIT_FAILURE_THRESHOLD") {
            config.circuit_failure_threshold =
                parse_env_value(&val, "FEEDBACK_CIRCUIT_FAILURE_THRESHOLD")?;
        }

        if let Some(val) = lookup("FEEDBACK_CIRCUIT_FAILURE_WINDOW_SECS") {
            let secs: u64 = parse_env_value(&val, "FEEDBACK_CIRCUIT_FAILURE_WINDOW_SECS")?;
            config.circuit_failure_window = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FEEDBACK_SLOW_PROCESSING_THRESHOLD_SECS") {
            let secs: f64 = parse_env_value(&val, "FEEDBACK_SLOW_PROCESSING_THRESHOLD_SECS")?;
            config.slow_processing_threshold =
                parse_secs_f64(secs, "FEEDBACK_SLOW_PROCESSING_THRESHOLD_SECS")?;
        }

        // Worker pool settings
        if let Some(val) = lookup("FEEDBACK_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "FEEDBACK_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("FEEDBACK_REMOTE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "FEEDBACK_REMOTE_TIMEOUT_SECS")?;
            config.remote_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("FEEDBACK_RECLAIM_EVERY_BATCHES") {
            config.reclaim_every_batches = parse_env_value(&val, "FEEDBACK_RECLAIM_EVERY_BATCHES")?;
        }

        // Cache settings
        if let Some(val) = lookup("FEEDBACK_CACHE_MAX_ENTRIES") {
            config.cache_max_entries = parse_env_value(&val, "FEEDBACK_CACHE_MAX_ENTRIES")?;
        }

        if let Some(val) = lookup("FEEDBACK_CACHE_MAX_PAYLOAD_CHARS") {
            config.cache_max_payload_chars =
                parse_env_value(&val, "FEEDBACK_CACHE_MAX_PAYLOAD_CHARS")?;
        }

        // Progress settings
        if let Some(val) = lookup("FEEDBACK_HISTORY_WINDOW") {
            config.history_window = parse_env_value(&val, "FEEDBACK_HISTORY_WINDOW")?;
        }

        if let Some(val) = lookup("FEEDBACK_PUBLISH_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "FEEDBACK_PUBLISH_TIMEOUT_MS")?;
            config.publish_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.batch_size_multiplier.is_finite() || self.batch_size_multiplier <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size_multiplier must be a positive number".to_string(),
            ));
        }

        if self.min_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_batch_size must be greater than 0".to_string(),
            ));
        }

        if !self.memory_reference_mb.is_finite() || self.memory_reference_mb <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "memory_reference_mb must be a positive number".to_string(),
            ));
        }

        if self.max_record_chars == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_record_chars must be greater than 0".to_string(),
            ));
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "circuit_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.circuit_failure_window.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "circuit_failure_window must be greater than 0".to_string(),
            ));
        }

        if self.slow_processing_threshold.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "slow_processing_threshold must be greater than 0".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.remote_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "remote_timeout must be greater than 0".to_string(),
            ));
        }

        if self.reclaim_every_batches == 0 {
            return Err(ConfigError::ValidationFailed(
                "reclaim_every_batches must be greater than 0".to_string(),
            ));
        }

        if self.cache_max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache_max_entries must be greater than 0".to_string(),
            ));
        }

        if self.history_window == 0 {
            return Err(ConfigError::ValidationFailed(
                "history_window must be greater than 0".to_string(),
            ));
        }

        if self.publish_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "publish_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the batch size multiplier.
    pub fn with_batch_size_multiplier(mut self, multiplier: f64) -> Self {
        self.batch_size_multiplier = multiplier;
        self
    }

    /// Builder method to set the minimum batch size.
    pub fn with_min_batch_size(mut self, size: usize) -> Self {
        self.min_batch_size = size;
        self
    }

    /// Builder method to set the memory reference point.
    pub fn with_memory_reference_mb(mut self, mb: f64) -> Self {
        self.memory_reference_mb = mb;
        self
    }

    /// Builder method to set the maximum record length.
    pub fn with_max_record_chars(mut self, chars: usize) -> Self {
        self.max_record_chars = chars;
        self
    }

    /// Builder method to set the circuit cool-down.
    pub fn with_circuit_cooldown(mut self, cooldown: Duration) -> Self {
        self.circuit_cooldown = cooldown;
        self
    }

    /// Builder method to set the circuit failure threshold.
    pub fn with_circuit_failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit_failure_threshold = threshold;
        self
    }

    /// Builder method to set the circuit failure window.
    pub fn with_circuit_failure_window(mut self, window: Duration) -> Self {
        self.circuit_failure_window = window;
        self
    }

    /// Builder method to set the slow processing threshold.
    pub fn with_slow_processing_threshold(mut self, threshold: Duration) -> Self {
        self.slow_processing_threshold = threshold;
        self
    }

    /// Builder method to set max workers.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    /// Builder method to set the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Builder method to set the reclaim interval.
    pub fn with_reclaim_every_batches(mut self, batches: usize) -> Self {
        self.reclaim_every_batches = batches;
        self
    }

    /// Builder method to set cache capacity.
    pub fn with_cache_max_entries(mut self, entries: usize) -> Self {
        self.cache_max_entries = entries;
        self
    }

    /// Builder method to set the largest cacheable payload.
    pub fn with_cache_max_payload_chars(mut self, chars: usize) -> Self {
        self.cache_max_payload_chars = chars;
        self
    }

    /// Builder method to set the throughput history window.
    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window;
        self
    }

    /// Builder method to set the sink publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Planner settings.
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig::default()
            .with_multiplier(self.batch_size_multiplier)
            .with_min_batch_size(self.min_batch_size)
            .with_memory_reference_mb(self.memory_reference_mb)
            .with_max_record_chars(self.max_record_chars)
    }

    /// Circuit breaker settings.
    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.circuit_failure_threshold)
            .with_failure_window(self.circuit_failure_window)
            .with_cooldown(self.circuit_cooldown)
            .with_slow_threshold(self.slow_processing_threshold)
    }

    /// Cache settings.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(self.cache_max_entries).with_max_payload_chars(self.cache_max_payload_chars)
    }

    /// Worker pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.max_workers)
            .with_remote_timeout(self.remote_timeout)
            .with_reclaim_every_batches(self.reclaim_every_batches)
    }
}

/// Parses an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Converts fractional seconds, rejecting negative or non-finite values.
fn parse_secs_f64(secs: f64, key: &str) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
