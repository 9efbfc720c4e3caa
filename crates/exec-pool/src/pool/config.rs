//! Pool configuration

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reliability::CircuitBreakerConfig;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value is outside its allowed range
    #[error("invalid pool configuration: {0}")]
    Invalid(String),
}

/// Process pool configuration
///
/// # Example
///
/// ```
/// use exec_pool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_max_workers(2)
///     .with_max_queue_size(10)
///     .with_task_timeout(Duration::from_secs(60));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Number of worker slots (concurrent processes)
    pub max_workers: usize,

    /// Default per-task time budget
    #[serde(with = "crate::serde_millis")]
    pub task_timeout: Duration,

    /// Maximum number of tasks waiting for a worker
    pub max_queue_size: usize,

    /// Default drain deadline for graceful shutdown
    #[serde(with = "crate::serde_millis")]
    pub shutdown_timeout: Duration,

    /// Breaker guarding the external binary
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_timeout: Duration::from_secs(300),
            max_queue_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `MAX_WORKERS`: Worker slots (default: 4)
    /// - `DEFAULT_TASK_TIMEOUT_MS`: Per-task timeout (default: 300000)
    /// - `MAX_QUEUE_SIZE`: Queue capacity (default: 100)
    /// - `SHUTDOWN_TIMEOUT_MS`: Graceful shutdown deadline (default: 30000)
    /// - `CIRCUIT_BREAKER_FAILURE_THRESHOLD`: Failures to open (default: 5)
    /// - `CIRCUIT_BREAKER_RESET_TIMEOUT_MS`: Open to half-open delay (default: 30000)
    /// - `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`: Successes to close (default: 2)
    /// - `CIRCUIT_BREAKER_FAILURE_WINDOW_MS`: Failure counting window (default: 60000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Missing or unparsable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        let defaults = Self::default();
        let breaker = defaults.circuit_breaker.clone();

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: parse(&lookup, "CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                .unwrap_or(breaker.failure_threshold),
            reset_timeout: parse(&lookup, "CIRCUIT_BREAKER_RESET_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(breaker.reset_timeout),
            success_threshold: parse(&lookup, "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")
                .unwrap_or(breaker.success_threshold),
            failure_window: parse(&lookup, "CIRCUIT_BREAKER_FAILURE_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(breaker.failure_window),
            ..breaker
        };

        Self {
            max_workers: parse::<usize>(&lookup, "MAX_WORKERS")
                .unwrap_or(defaults.max_workers)
                .max(1),
            task_timeout: parse(&lookup, "DEFAULT_TASK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.task_timeout),
            max_queue_size: parse(&lookup, "MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            shutdown_timeout: parse(&lookup, "SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
            circuit_breaker,
        }
    }

    /// Set the number of workers (at least 1)
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    /// Set the default task timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the queue capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the graceful shutdown deadline
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::Invalid("task_timeout must be non-zero".into()));
        }
        let breaker = &self.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return Err(ConfigError::Invalid(
                "circuit breaker thresholds must be at least 1".into(),
            ));
        }
        if breaker.failure_window.is_zero() {
            return Err(ConfigError::Invalid(
                "circuit breaker failure_window must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
