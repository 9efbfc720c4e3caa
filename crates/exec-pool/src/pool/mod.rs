//! Worker pool
//!
//! - [`ProcessPool`] - Bounded-concurrency executor with a FIFO queue
//! - [`PoolConfig`] - Sizing, timeouts and breaker settings
//! - [`PoolStats`] / [`PoolEvent`] - Observability

mod config;
mod process_pool;
mod stats;
mod task;

pub use config::{ConfigError, PoolConfig};
pub use process_pool::{ProcessPool, ProcessPoolBuilder, ShutdownSummary};
pub use stats::{PoolEvent, PoolStats};
pub use task::{ExecOptions, ExecutionResult, TaskHandle, TaskId, WorkerId};
