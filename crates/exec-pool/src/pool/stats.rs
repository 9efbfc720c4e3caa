//! Pool statistics and lifecycle events

use std::time::Duration;

use serde::Serialize;

use super::task::{TaskId, WorkerId};

/// Live snapshot of pool load and history
///
/// `busy_workers + idle_workers == total_workers` always holds. Workers
/// draining after a shrink are counted as busy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    /// Processes that ran to exit (any exit code)
    pub completed_tasks: u64,
    /// Spawn failures, timeouts and aborts
    pub failed_tasks: u64,
    /// Mean wall time of completed tasks, zero when none completed
    #[serde(rename = "average_duration_ms", with = "crate::serde_millis")]
    pub average_duration: Duration,
}

/// Counters accumulated over the pool's lifetime
#[derive(Debug, Default)]
pub(crate) struct TaskCounters {
    pub completed: u64,
    pub failed: u64,
    pub cumulative_duration: Duration,
}

impl TaskCounters {
    pub fn record_completed(&mut self, duration: Duration) {
        self.completed += 1;
        self.cumulative_duration += duration;
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn average_duration(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        let nanos = self.cumulative_duration.as_nanos() / u128::from(self.completed);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Pool lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    /// No worker was idle; the task is waiting at `position` (0 = next)
    TaskQueued { task_id: TaskId, position: usize },

    /// The task was bound to a worker and its process is being spawned
    TaskStarted { task_id: TaskId, worker_id: WorkerId },

    /// The process exited; see `exit_code`
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        exit_code: Option<i32>,
        #[serde(rename = "duration_ms", with = "crate::serde_millis")]
        duration: Duration,
    },

    /// The task failed at runtime (spawn error, timeout, abort)
    TaskFailed {
        task_id: TaskId,
        worker_id: WorkerId,
        kind: &'static str,
    },

    /// A queued task was removed before it started
    TaskCancelled { task_id: TaskId },

    /// Worker capacity changed
    Resized { from: usize, to: usize },

    /// Shutdown finished
    Shutdown,
}
