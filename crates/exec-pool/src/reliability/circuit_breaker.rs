//! Circuit breaker
//!
//! Generic fail-fast state machine wrapping arbitrary async operations. It
//! knows nothing about processes; the pool reports outcomes through a
//! [`CircuitPermit`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEvent, AuditSink};
use crate::events::{EventBus, Subscription};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// When failures inside the sliding window reach the threshold, the circuit
/// "opens" and calls fail fast without running the operation.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄────────────── └──────────┘
///      ▲                                       any failure         │
///      │                                                            │
///      │              success threshold (consecutive)               │
///      └────────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use exec_pool::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Name used in logs, stats and errors
    pub name: String,

    /// Number of failures inside the window required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,

    /// Sliding window for failure counting
    #[serde(with = "crate::serde_millis")]
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "engine-cli".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            failure_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the breaker name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the reset timeout (time before trying again after opening)
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the sliding window for failure counting
    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    /// Failures currently inside the sliding window
    pub failures_in_window: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

/// Returned instead of running the operation while the circuit is open
#[derive(Debug, Clone, Error)]
#[error("circuit breaker '{}' is open", stats.name)]
pub struct CircuitOpenError {
    /// Snapshot taken when the call was rejected
    pub stats: CircuitBreakerStats,
    /// Time left until the breaker admits a trial call
    pub retry_after: Option<Duration>,
}

/// Error from [`CircuitBreaker::execute`]
///
/// The operation's own error is passed through untouched as `Inner`.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Rejected without running the operation
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    /// The operation ran and failed
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected by an open circuit
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// The operation's error, if it ran
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open(_) => None,
        }
    }
}

/// What happened inside the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventKind {
    Success,
    Failure,
    Open,
    Close,
    HalfOpen,
    Reset,
}

/// Breaker event with the stats at emission time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub kind: CircuitEventKind,
    pub stats: CircuitBreakerStats,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    consecutive_successes: u32,
    total_requests: u64,
    rejected_requests: u64,
    total_successes: u64,
    total_failures: u64,
    opened_at: Option<Instant>,
    /// Bumped on every open/reset so stale reset timers do nothing
    generation: u64,
    reset_timer: Option<AbortHandle>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            consecutive_successes: 0,
            total_requests: 0,
            rejected_requests: 0,
            total_successes: 0,
            total_failures: 0,
            opened_at: None,
            generation: 0,
            reset_timer: None,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}

struct Shared {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    events: EventBus<CircuitEvent>,
    audit: Option<Arc<dyn AuditSink>>,
}

/// In-process circuit breaker
///
/// Cloning yields another handle to the same breaker.
///
/// # Example
///
/// ```ignore
/// use exec_pool::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
///
/// match breaker.execute(|| call_engine()).await {
///     Ok(output) => use_output(output),
///     Err(CircuitBreakerError::Open(open)) => {
///         // Fail fast, retry after open.retry_after
///     }
///     Err(CircuitBreakerError::Inner(e)) => return Err(e),
/// }
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a breaker in the closed state
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a breaker that reports state transitions to an audit sink
    pub fn with_audit(config: CircuitBreakerConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: CircuitBreakerConfig, audit: Option<Arc<dyn AuditSink>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(BreakerState::new()),
                events: EventBus::new(),
                audit,
            }),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        let mut state = self.shared.state.lock();
        self.shared.half_open_if_due(&mut state, Instant::now());
        state.state
    }

    /// Current stats snapshot
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.shared.state.lock();
        self.shared.snapshot(&state, Instant::now())
    }

    /// Listen for breaker events
    pub fn subscribe(&self) -> Subscription<CircuitEvent> {
        self.shared.events.subscribe()
    }

    /// Ask to run one call
    ///
    /// The returned permit must be settled with [`CircuitPermit::success`] or
    /// [`CircuitPermit::failure`]; dropping it records nothing.
    pub fn allow(&self) -> Result<CircuitPermit, CircuitOpenError> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        self.shared.half_open_if_due(&mut state, now);
        state.total_requests += 1;

        if state.state == CircuitState::Open {
            state.rejected_requests += 1;
            let retry_after = state
                .opened_at
                .map(|at| {
                    self.shared
                        .config
                        .reset_timeout
                        .saturating_sub(now.saturating_duration_since(at))
                });
            debug!(breaker = %self.name(), "Circuit open, rejecting call");
            return Err(CircuitOpenError {
                stats: self.shared.snapshot(&state, now),
                retry_after,
            });
        }

        Ok(CircuitPermit {
            breaker: self.clone(),
        })
    }

    /// Run `op` through the breaker
    ///
    /// While open, returns [`CircuitBreakerError::Open`] without calling `op`.
    /// Otherwise the outcome is recorded and `op`'s error is returned
    /// unchanged inside [`CircuitBreakerError::Inner`].
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.allow()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.total_successes += 1;

        match state.state {
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                self.shared.emit(&state, now, CircuitEventKind::Success);
                if state.consecutive_successes >= self.shared.config.success_threshold {
                    self.shared.close(&mut state, now);
                }
            }
            CircuitState::Closed => {
                state.consecutive_successes = state.consecutive_successes.saturating_add(1);
                self.shared.emit(&state, now, CircuitEventKind::Success);
            }
            // A call admitted before the circuit opened finished late
            CircuitState::Open => {
                self.shared.emit(&state, now, CircuitEventKind::Success);
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        state.total_failures += 1;
        state.consecutive_successes = 0;
        state.failures.push_back(now);
        state.prune(now, self.shared.config.failure_window);
        self.shared.emit(&state, now, CircuitEventKind::Failure);

        match state.state {
            CircuitState::Closed => {
                if state.failures.len() >= self.shared.config.failure_threshold as usize {
                    Shared::open(&self.shared, &mut state, now);
                }
            }
            CircuitState::HalfOpen => {
                Shared::open(&self.shared, &mut state, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker closed and clear all history
    pub fn reset(&self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        let previous = state.state;

        state.cancel_timer();
        state.generation += 1;
        state.state = CircuitState::Closed;
        state.failures.clear();
        state.consecutive_successes = 0;
        state.total_requests = 0;
        state.rejected_requests = 0;
        state.total_successes = 0;
        state.total_failures = 0;
        state.opened_at = None;

        info!(breaker = %self.name(), from = %previous, "Circuit breaker reset");
        self.shared.audit_transition(previous, CircuitState::Closed);
        self.shared.emit(&state, now, CircuitEventKind::Reset);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.config.name)
            .field("state", &self.shared.state.lock().state)
            .finish()
    }
}

impl Shared {
    fn snapshot(&self, state: &BreakerState, now: Instant) -> CircuitBreakerStats {
        let failures_in_window = state
            .failures
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= self.config.failure_window)
            .count() as u32;

        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: state.state,
            failures_in_window,
            consecutive_successes: state.consecutive_successes,
            total_requests: state.total_requests,
            rejected_requests: state.rejected_requests,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
        }
    }

    fn emit(&self, state: &BreakerState, now: Instant, kind: CircuitEventKind) {
        self.events.emit(CircuitEvent {
            kind,
            stats: self.snapshot(state, now),
        });
    }

    fn audit_transition(&self, from: CircuitState, to: CircuitState) {
        if let Some(sink) = &self.audit {
            audit::dispatch(
                sink,
                AuditEvent::CircuitTransition {
                    breaker: self.config.name.clone(),
                    from,
                    to,
                    at: Utc::now(),
                },
            );
        }
    }

    fn open(shared: &Arc<Shared>, state: &mut BreakerState, now: Instant) {
        let previous = state.state;
        state.cancel_timer();
        state.generation += 1;
        state.state = CircuitState::Open;
        state.opened_at = Some(now);
        state.consecutive_successes = 0;

        let generation = state.generation;
        let reset_timeout = shared.config.reset_timeout;
        let weak: Weak<Shared> = Arc::downgrade(shared);
        // Without a runtime the transition happens lazily on the next call
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let timer = handle.spawn(async move {
                tokio::time::sleep(reset_timeout).await;
                if let Some(shared) = weak.upgrade() {
                    shared.reset_timer_fired(generation);
                }
            });
            state.reset_timer = Some(timer.abort_handle());
        }

        warn!(
            breaker = %shared.config.name,
            failures = state.failures.len(),
            reset_timeout_ms = reset_timeout.as_millis() as u64,
            "Circuit breaker opened"
        );
        shared.audit_transition(previous, CircuitState::Open);
        shared.emit(state, now, CircuitEventKind::Open);
    }

    fn close(&self, state: &mut BreakerState, now: Instant) {
        let previous = state.state;
        state.cancel_timer();
        state.state = CircuitState::Closed;
        state.failures.clear();
        state.consecutive_successes = 0;
        state.opened_at = None;

        info!(breaker = %self.config.name, "Circuit breaker closed");
        self.audit_transition(previous, CircuitState::Closed);
        self.emit(state, now, CircuitEventKind::Close);
    }

    fn half_open(&self, state: &mut BreakerState, now: Instant) {
        state.reset_timer = None;
        state.state = CircuitState::HalfOpen;
        state.consecutive_successes = 0;

        info!(breaker = %self.config.name, "Circuit breaker half-open, allowing trial calls");
        self.audit_transition(CircuitState::Open, CircuitState::HalfOpen);
        self.emit(state, now, CircuitEventKind::HalfOpen);
    }

    fn half_open_if_due(&self, state: &mut BreakerState, now: Instant) {
        if state.state != CircuitState::Open {
            return;
        }
        let due = state
            .opened_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.config.reset_timeout);
        if due {
            state.cancel_timer();
            self.half_open(state, now);
        }
    }

    fn reset_timer_fired(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.state == CircuitState::Open && state.generation == generation {
            self.half_open(&mut state, Instant::now());
        }
    }
}

/// Admission ticket for one call through a [`CircuitBreaker`]
#[must_use = "settle the permit with success() or failure()"]
pub struct CircuitPermit {
    breaker: CircuitBreaker,
}

impl CircuitPermit {
    /// Report the call succeeded
    pub fn success(self) {
        self.breaker.record_success();
    }

    /// Report the call failed
    pub fn failure(self) {
        self.breaker.record_failure();
    }
}

impl std::fmt::Debug for CircuitPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("breaker", &self.breaker.name())
            .finish()
    }
}
