//! # Exec Pool
//!
//! Bounded-concurrency execution of an external command-line binary (a game
//! engine, a compiler, an asset tool) on behalf of many concurrent callers.
//!
//! ## Features
//!
//! - **Worker slots with a FIFO queue**: at most `max_workers` processes run at once
//! - **Argument screening**: shell operators, metacharacters and path traversal are rejected up front
//! - **Timeouts and cancellation**: overdue processes are killed, queued tasks can be withdrawn
//! - **Circuit breaker**: repeated spawn failures or timeouts make the pool fail fast
//! - **Graceful shutdown**: drain with a deadline, then force-kill
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PoolProvider                            │
//! │  (lazily builds the process-wide pool, rebuilds after close) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ProcessPool                             │
//! │  (validator -> capacity -> circuit breaker -> worker/queue)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ProcessLauncher                           │
//! │  (spawns the child, collects output, kills on request)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use exec_pool::prelude::*;
//!
//! let provider = PoolProvider::new(PoolConfig::from_env());
//! let pool = provider.get();
//!
//! let result = pool
//!     .execute("godot", ["--headless", "--export-release", "Linux"], ExecOptions::default())
//!     .await?;
//! println!("exit code {:?} after {:?}", result.exit_code, result.duration);
//!
//! provider.shutdown().await;
//! ```

pub mod audit;
pub mod error;
pub mod events;
pub mod launcher;
pub mod pool;
pub mod provider;
pub mod reliability;
pub mod security;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::PoolError;
    pub use crate::pool::{
        ExecOptions, ExecutionResult, PoolConfig, PoolEvent, PoolStats, ProcessPool,
        ShutdownSummary, TaskHandle, TaskId,
    };
    pub use crate::provider::PoolProvider;
    pub use crate::reliability::{CircuitBreakerConfig, CircuitState};
}

// Re-export key types at crate root
pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use error::PoolError;
pub use events::{EventBus, Subscription};
pub use launcher::{CommandRequest, LaunchError, ProcessLauncher, ProcessOutput, SystemLauncher};
pub use pool::{
    ConfigError, ExecOptions, ExecutionResult, PoolConfig, PoolEvent, PoolStats, ProcessPool,
    ProcessPoolBuilder, ShutdownSummary, TaskHandle, TaskId, WorkerId,
};
pub use provider::PoolProvider;
pub use reliability::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitEvent, CircuitState,
};
pub use security::{validate_command, ValidationError};

/// Serde support for Duration as milliseconds
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
