//! Pool error taxonomy

use std::time::Duration;

use thiserror::Error;

use crate::launcher::LaunchError;
use crate::pool::TaskId;
use crate::reliability::CircuitOpenError;
use crate::security::ValidationError;

/// Errors returned by [`ProcessPool`](crate::ProcessPool) operations
///
/// Admission errors (`Validation`, `QueueFull`, `ShuttingDown`, `CircuitOpen`)
/// are raised before any process exists. `Spawn` and `Timeout` are runtime
/// failures and are the only kinds recorded by the circuit breaker.
/// A non-zero exit code is not an error.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Command or arguments failed pre-flight validation
    #[error("command rejected: {0}")]
    Validation(#[from] ValidationError),

    /// Every worker is busy and the queue is at capacity
    #[error("task queue is full ({max_queue_size} tasks waiting)")]
    QueueFull { max_queue_size: usize },

    /// The pool no longer accepts work
    #[error("pool is shutting down")]
    ShuttingDown,

    /// The circuit breaker is failing fast
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The process could not be started or its output collected
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: LaunchError,
    },

    /// The process outlived its time budget and was killed
    #[error("task {task_id} timed out after {}ms", limit.as_millis())]
    Timeout { task_id: TaskId, limit: Duration },

    /// The task was removed from the queue before it started
    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    /// The worker running the task went away without reporting a result
    #[error("task {task_id} was aborted before reporting a result")]
    Aborted { task_id: TaskId },

    /// Requested pool size is below the minimum
    #[error("Pool size must be at least 1")]
    InvalidSize(usize),
}

impl PoolError {
    /// Stable tag for mapping errors to caller-facing messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::QueueFull { .. } => "queue_full",
            Self::ShuttingDown => "shutting_down",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Spawn { .. } => "spawn",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Aborted { .. } => "aborted",
            Self::InvalidSize(_) => "invalid_size",
        }
    }

    /// Whether this outcome counts against the circuit breaker
    pub fn counts_as_failure(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::Timeout { .. })
    }

    /// Rejected before any process was spawned
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::QueueFull { .. } | Self::ShuttingDown | Self::CircuitOpen(_)
        )
    }
}
