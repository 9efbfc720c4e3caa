//! Task types: identifiers, per-call options, results and handles

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::PoolError;

/// Unique task identifier (UUID v7, ordered by creation time)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Worker slot identifier, stable for the slot's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Working directory for the process
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Overrides the pool's default task timeout
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the task timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a process that ran to completion
///
/// A non-zero `exit_code` is still a successful pool operation; the caller
/// decides what it means.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    /// Wall time from spawn to exit
    #[serde(rename = "duration_ms", with = "crate::serde_millis")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Whether the process exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub(crate) type TaskReply = oneshot::Sender<Result<ExecutionResult, PoolError>>;

/// Handle to a submitted task
///
/// Await the handle (or call [`TaskHandle::wait`]) for the outcome. Dropping
/// it does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<Result<ExecutionResult, PoolError>>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<Result<ExecutionResult, PoolError>>) -> Self {
        Self { id, rx }
    }

    /// Id to pass to [`ProcessPool::cancel_task`](crate::ProcessPool::cancel_task)
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task to settle
    pub async fn wait(self) -> Result<ExecutionResult, PoolError> {
        self.await
    }
}

impl Future for TaskHandle {
    type Output = Result<ExecutionResult, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let task_id = self.id;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Aborted { task_id })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }

    #[test]
    fn test_options_builder() {
        let options = ExecOptions::new()
            .with_cwd("/projects/game")
            .with_env("GODOT_SILENCE", "1")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(options.cwd, Some(PathBuf::from("/projects/game")));
        assert_eq!(options.env.get("GODOT_SILENCE").map(String::as_str), Some("1"));
        assert_eq!(options.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_result_serialization() {
        let result = ExecutionResult {
            task_id: TaskId::new(),
            stdout: "ok".into(),
            stderr: String::new(),
            exit_code: Some(2),
            duration: Duration::from_millis(42),
        };
        assert!(!result.success());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration_ms"], 42);
        assert_eq!(json["exit_code"], 2);
    }

    #[tokio::test]
    async fn test_handle_resolves_with_reply() {
        let (tx, rx) = oneshot::channel();
        let id = TaskId::new();
        let handle = TaskHandle::new(id, rx);
        assert_eq!(handle.id(), id);

        tx.send(Err(PoolError::Cancelled { task_id: id })).unwrap();
        assert!(matches!(handle.await, Err(PoolError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_handle_reports_abort_when_sender_dropped() {
        let (tx, rx) = oneshot::channel();
        let id = TaskId::new();
        drop(tx);
        let err = TaskHandle::new(id, rx).wait().await.unwrap_err();
        assert!(matches!(err, PoolError::Aborted { task_id } if task_id == id));
    }
}
