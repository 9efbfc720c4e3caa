// Audit Sink
//
// Observability hook invoked at spawn, timeout, kill and circuit-transition
// points. Dispatch is fire-and-forget: the sink runs on a detached task so a
// slow, failing or panicking sink can never hold up task execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::pool::{TaskId, WorkerId};
use crate::reliability::CircuitState;

// ============================================================================
// AuditEvent
// ============================================================================

/// An auditable point in a task's or breaker's life
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A task was handed to the launcher; the spawn itself may still fail
    Launching {
        task_id: TaskId,
        worker_id: WorkerId,
        command: String,
        args: Vec<String>,
        at: DateTime<Utc>,
    },

    /// The operating system refused to start the process
    SpawnFailed {
        task_id: TaskId,
        worker_id: WorkerId,
        command: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// A task outlived its timeout and its process was killed
    TimedOut {
        task_id: TaskId,
        worker_id: WorkerId,
        #[serde(with = "crate::serde_millis")]
        limit: Duration,
        at: DateTime<Utc>,
    },

    /// A running process was force-killed (shutdown deadline or operator)
    Killed {
        task_id: TaskId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },

    /// A circuit breaker changed state
    CircuitTransition {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    /// Short stable name for the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Launching { .. } => "process.launching",
            Self::SpawnFailed { .. } => "process.spawn_failed",
            Self::TimedOut { .. } => "process.timed_out",
            Self::Killed { .. } => "process.killed",
            Self::CircuitTransition { .. } => "circuit.transition",
        }
    }
}

// ============================================================================
// AuditSink Trait
// ============================================================================

/// Receiver for audit events.
///
/// Implementations may do I/O; they are always invoked on a detached task
/// and their completion is never awaited by the pool.
///
/// # Example
///
/// ```ignore
/// use exec_pool::audit::{AuditEvent, AuditSink};
///
/// struct FileAuditSink { path: PathBuf }
///
/// #[async_trait]
/// impl AuditSink for FileAuditSink {
///     async fn record(&self, event: AuditEvent) {
///         let line = serde_json::to_string(&event).unwrap_or_default();
///         let _ = append_line(&self.path, &line).await;
///     }
/// }
/// ```
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Handle one event
    async fn record(&self, event: AuditEvent);

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "AuditSink"
    }
}

// ============================================================================
// TracingAuditSink
// ============================================================================

/// Default sink that writes audit events to the `tracing` log
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        let event_type = event.event_type();
        match &event {
            AuditEvent::Launching {
                task_id,
                worker_id,
                command,
                ..
            } => {
                debug!(target: "exec_pool::audit", %event_type, %task_id, %worker_id, %command);
            }
            AuditEvent::SpawnFailed {
                task_id,
                worker_id,
                command,
                error,
                ..
            } => {
                warn!(target: "exec_pool::audit", %event_type, %task_id, %worker_id, %command, %error);
            }
            AuditEvent::TimedOut {
                task_id,
                worker_id,
                limit,
                ..
            } => {
                warn!(target: "exec_pool::audit", %event_type, %task_id, %worker_id, ?limit);
            }
            AuditEvent::Killed {
                task_id, worker_id, ..
            } => {
                warn!(target: "exec_pool::audit", %event_type, %task_id, %worker_id);
            }
            AuditEvent::CircuitTransition {
                breaker, from, to, ..
            } => {
                info!(target: "exec_pool::audit", %event_type, %breaker, %from, %to);
            }
        }
    }

    fn name(&self) -> &'static str {
        "TracingAuditSink"
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Hand an event to the sink without waiting for it.
///
/// Outside a tokio runtime the event is dropped.
pub(crate) fn dispatch(sink: &Arc<dyn AuditSink>, event: AuditEvent) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let sink = Arc::clone(sink);
            handle.spawn(async move { sink.record(event).await });
        }
        Err(_) => {
            debug!(
                sink = sink.name(),
                event_type = event.event_type(),
                "No runtime available, audit event dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<AuditEvent>>,
    }

    #[async_trait]
    impl AuditSink for CollectingSink {
        async fn record(&self, event: AuditEvent) {
            self.events.lock().push(event);
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl AuditSink for PanickingSink {
        async fn record(&self, _event: AuditEvent) {
            panic!("sink exploded");
        }
    }

    fn transition() -> AuditEvent {
        AuditEvent::CircuitTransition {
            breaker: "engine".to_string(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(transition().event_type(), "circuit.transition");

        let failed = AuditEvent::SpawnFailed {
            task_id: TaskId::new(),
            worker_id: WorkerId(0),
            command: "godot".to_string(),
            error: "No such file or directory".to_string(),
            at: Utc::now(),
        };
        assert_eq!(failed.event_type(), "process.spawn_failed");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["type"], "spawn_failed");
    }

    #[test]
    fn test_serializes_with_tag() {
        let json = serde_json::to_value(transition()).unwrap();
        assert_eq!(json["type"], "circuit_transition");
        assert_eq!(json["from"], "closed");
        assert_eq!(json["to"], "open");
    }

    #[test]
    fn test_dispatch_without_runtime_is_noop() {
        let sink: Arc<dyn AuditSink> = Arc::new(CollectingSink::default());
        dispatch(&sink, transition());
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let collecting = Arc::new(CollectingSink::default());
        let sink: Arc<dyn AuditSink> = collecting.clone();

        dispatch(&sink, transition());

        for _ in 0..50 {
            if !collecting.events.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(collecting.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_propagate() {
        let sink: Arc<dyn AuditSink> = Arc::new(PanickingSink);
        dispatch(&sink, transition());
        tokio::task::yield_now().await;
        // Still running
        dispatch(&sink, transition());
    }
}
