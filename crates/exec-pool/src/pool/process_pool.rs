//! Process pool
//!
//! Runs external commands on a fixed set of worker slots with a FIFO queue,
//! per-task timeouts and a circuit breaker in front of the binary.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::config::PoolConfig;
use super::stats::{PoolEvent, PoolStats, TaskCounters};
use super::task::{ExecOptions, ExecutionResult, TaskHandle, TaskId, TaskReply, WorkerId};
use crate::audit::{self, AuditEvent, AuditSink, TracingAuditSink};
use crate::error::PoolError;
use crate::events::{EventBus, Subscription};
use crate::launcher::{CommandRequest, LaunchError, ProcessLauncher, ProcessOutput, SystemLauncher};
use crate::reliability::{
    CircuitBreaker, CircuitBreakerStats, CircuitEvent, CircuitPermit, CircuitState,
};
use crate::security::validate_command;

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownSummary {
    /// Queued tasks rejected with `Cancelled`
    pub cancelled: usize,
    /// Running processes killed after the drain deadline
    pub force_killed: usize,
}

struct PendingTask {
    id: TaskId,
    request: CommandRequest,
    timeout: Duration,
    permit: CircuitPermit,
    reply: TaskReply,
}

struct RunningTask {
    task_id: TaskId,
    kill: CancellationToken,
}

struct Worker {
    id: WorkerId,
    running: Option<RunningTask>,
    /// Removed instead of freed when its task settles
    retiring: bool,
}

impl Worker {
    fn is_busy(&self) -> bool {
        self.running.is_some()
    }
}

struct PoolState {
    workers: Vec<Worker>,
    queue: VecDeque<PendingTask>,
    next_worker_id: usize,
    shutting_down: bool,
    counters: TaskCounters,
}

impl PoolState {
    fn new(workers: usize) -> Self {
        let mut state = Self {
            workers: Vec::with_capacity(workers),
            queue: VecDeque::new(),
            next_worker_id: 0,
            shutting_down: false,
            counters: TaskCounters::default(),
        };
        for _ in 0..workers {
            state.add_worker();
        }
        state
    }

    fn add_worker(&mut self) {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;
        self.workers.push(Worker {
            id,
            running: None,
            retiring: false,
        });
    }

    fn idle_worker(&self) -> Option<usize> {
        self.workers.iter().position(|w| !w.is_busy())
    }

    fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// Workers that will still exist once retiring ones drain
    fn active_count(&self) -> usize {
        self.workers.iter().filter(|w| !w.retiring).count()
    }
}

/// A task bound to a worker, launched once the state lock is released
struct Dispatch {
    worker_id: WorkerId,
    task: PendingTask,
    kill: CancellationToken,
}

enum Outcome {
    Exited(ProcessOutput),
    LaunchFailed(LaunchError),
    TimedOut,
    Aborted,
}

struct PoolInner {
    config: PoolConfig,
    launcher: Arc<dyn ProcessLauncher>,
    audit: Arc<dyn AuditSink>,
    breaker: CircuitBreaker,
    state: Mutex<PoolState>,
    events: EventBus<PoolEvent>,
    /// Notified whenever the last busy worker is freed
    idle: Notify,
}

/// Builder for [`ProcessPool`]
pub struct ProcessPoolBuilder {
    config: PoolConfig,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ProcessPoolBuilder {
    /// Use a custom launcher instead of [`SystemLauncher`]
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Use a custom audit sink instead of [`TracingAuditSink`]
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn build(self) -> ProcessPool {
        let mut config = self.config;
        config.max_workers = config.max_workers.max(1);

        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(SystemLauncher::new()));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(TracingAuditSink));
        let breaker = CircuitBreaker::with_audit(config.circuit_breaker.clone(), Arc::clone(&audit));

        info!(
            max_workers = config.max_workers,
            max_queue_size = config.max_queue_size,
            task_timeout_ms = config.task_timeout.as_millis() as u64,
            launcher = launcher.name(),
            audit_sink = audit.name(),
            "Process pool created"
        );

        ProcessPool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::new(config.max_workers)),
                config,
                launcher,
                audit,
                breaker,
                events: EventBus::new(),
                idle: Notify::new(),
            }),
        }
    }
}

/// Bounded-concurrency pool of external processes
///
/// All bookkeeping (worker slots, queue, counters) sits behind one mutex, so
/// "find an idle worker and mark it busy" is atomic. Each running task is
/// driven by its own tokio task. Cloning yields another handle to the same
/// pool.
///
/// Methods that can start a process must be called within a Tokio runtime.
///
/// # Example
///
/// ```ignore
/// use exec_pool::{ExecOptions, PoolConfig, ProcessPool};
///
/// let pool = ProcessPool::new(PoolConfig::from_env());
///
/// let result = pool
///     .execute("godot", ["--headless", "--version"], ExecOptions::default())
///     .await?;
/// if !result.success() {
///     eprintln!("engine exited with {:?}: {}", result.exit_code, result.stderr);
/// }
///
/// // ... later, graceful shutdown
/// pool.shutdown(Duration::from_secs(10)).await;
/// ```
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl ProcessPool {
    /// Create a pool that spawns real processes
    pub fn new(config: PoolConfig) -> Self {
        Self::builder(config).build()
    }

    /// Start building a pool with custom collaborators
    pub fn builder(config: PoolConfig) -> ProcessPoolBuilder {
        ProcessPoolBuilder {
            config,
            launcher: None,
            audit: None,
        }
    }

    /// Pool configuration as constructed
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Run a command and wait for it to settle
    #[instrument(skip_all)]
    pub async fn execute<C, I, S>(
        &self,
        command: C,
        args: I,
        options: ExecOptions,
    ) -> Result<ExecutionResult, PoolError>
    where
        C: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(command, args, options)?.await
    }

    /// Admit a command without waiting for it
    ///
    /// Admission order: shutting-down check, argument validation, capacity
    /// (idle worker or queue room), circuit breaker. A task that finds an
    /// idle worker starts immediately, even if others are queued.
    pub fn submit<C, I, S>(
        &self,
        command: C,
        args: I,
        options: ExecOptions,
    ) -> Result<TaskHandle, PoolError>
    where
        C: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let inner = &self.inner;
        if inner.state.lock().shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        let command = command.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if let Err(e) = validate_command(&command, &args) {
            debug!(%command, error = %e, "Command rejected by validator");
            return Err(e.into());
        }

        let task_id = TaskId::new();
        let timeout = options.timeout.unwrap_or(inner.config.task_timeout);
        let request = CommandRequest {
            command,
            args,
            cwd: options.cwd,
            env: options.env,
        };

        let mut state = inner.state.lock();
        if state.shutting_down {
            return Err(PoolError::ShuttingDown);
        }

        let idle = state.idle_worker();
        if idle.is_none() && state.queue.len() >= inner.config.max_queue_size {
            debug!(%task_id, queued = state.queue.len(), "Queue full, rejecting task");
            return Err(PoolError::QueueFull {
                max_queue_size: inner.config.max_queue_size,
            });
        }

        let permit = inner.breaker.allow()?;
        let (reply, rx) = oneshot::channel();
        let task = PendingTask {
            id: task_id,
            request,
            timeout,
            permit,
            reply,
        };

        match idle {
            Some(index) => {
                let dispatch = inner.bind(&mut state, index, task);
                drop(state);
                inner.launch(dispatch);
            }
            None => {
                state.queue.push_back(task);
                let position = state.queue.len() - 1;
                debug!(%task_id, position, "All workers busy, task queued");
                inner.events.emit(PoolEvent::TaskQueued { task_id, position });
            }
        }

        Ok(TaskHandle::new(task_id, rx))
    }

    /// Remove a task that is still waiting in the queue
    ///
    /// Returns `false` for running, finished or unknown tasks; a running
    /// process is never interrupted through this call.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            match state.queue.iter().position(|t| t.id == task_id) {
                Some(position) => state.queue.remove(position),
                None => None,
            }
        };

        match task {
            Some(task) => {
                self.inner.reject_cancelled(task);
                true
            }
            None => false,
        }
    }

    /// Reject every queued task; running tasks are unaffected
    pub fn cancel_all_queued(&self) -> usize {
        let tasks: Vec<PendingTask> = self.inner.state.lock().queue.drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            self.inner.reject_cancelled(task);
        }
        if count > 0 {
            info!(count, "Cancelled queued tasks");
        }
        count
    }

    /// Ids of queued tasks, next to run first
    pub fn queued_task_ids(&self) -> Vec<TaskId> {
        self.inner.state.lock().queue.iter().map(|t| t.id).collect()
    }

    /// Live statistics snapshot
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let total_workers = state.workers.len();
        let busy_workers = state.busy_count();

        PoolStats {
            total_workers,
            busy_workers,
            idle_workers: total_workers - busy_workers,
            queued_tasks: state.queue.len(),
            completed_tasks: state.counters.completed,
            failed_tasks: state.counters.failed,
            average_duration: state.counters.average_duration(),
        }
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Listen for pool lifecycle events
    pub fn subscribe(&self) -> Subscription<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Listen for circuit breaker events
    pub fn subscribe_circuit(&self) -> Subscription<CircuitEvent> {
        self.inner.breaker.subscribe()
    }

    /// Current circuit breaker state
    pub fn circuit_state(&self) -> CircuitState {
        self.inner.breaker.state()
    }

    /// Circuit breaker stats snapshot
    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.inner.breaker.stats()
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit(&self) {
        self.inner.breaker.reset();
    }

    /// Change the number of worker slots
    ///
    /// Growing adds idle workers and starts queued tasks on them. Shrinking
    /// removes idle workers first; busy workers over the target finish their
    /// current task and are then removed.
    pub fn resize(&self, size: usize) -> Result<(), PoolError> {
        if size < 1 {
            return Err(PoolError::InvalidSize(size));
        }

        let mut state = self.inner.state.lock();
        let from = state.active_count();

        if size > from {
            let mut needed = size - from;
            for worker in state.workers.iter_mut().filter(|w| w.retiring) {
                if needed == 0 {
                    break;
                }
                worker.retiring = false;
                needed -= 1;
            }
            for _ in 0..needed {
                state.add_worker();
            }
        } else if size < from {
            let mut excess = from - size;
            while excess > 0 {
                match state.workers.iter().rposition(|w| !w.is_busy()) {
                    Some(index) => {
                        state.workers.remove(index);
                        excess -= 1;
                    }
                    None => break,
                }
            }
            for worker in state.workers.iter_mut().rev().filter(|w| !w.retiring) {
                if excess == 0 {
                    break;
                }
                worker.retiring = true;
                excess -= 1;
            }
        }

        let dispatches = self.inner.drain_queue(&mut state);
        let total = state.workers.len();
        drop(state);

        info!(from, to = size, total_workers = total, "Pool resized");
        self.inner.events.emit(PoolEvent::Resized { from, to: size });
        for dispatch in dispatches {
            self.inner.launch(dispatch);
        }
        Ok(())
    }

    /// Signal every running process to terminate
    ///
    /// Returns the number of processes signalled. Their tasks settle with the
    /// output collected so far and no exit code.
    pub fn force_kill_all(&self) -> usize {
        let state = self.inner.state.lock();
        let mut killed = 0;
        for worker in &state.workers {
            if let Some(running) = &worker.running {
                running.kill.cancel();
                killed += 1;
                audit::dispatch(
                    &self.inner.audit,
                    AuditEvent::Killed {
                        task_id: running.task_id,
                        worker_id: worker.id,
                        at: Utc::now(),
                    },
                );
            }
        }
        if killed > 0 {
            warn!(killed, "Force-killed running processes");
        }
        killed
    }

    /// Stop accepting work and drain
    ///
    /// New submissions are rejected from the moment this is called. Queued
    /// tasks are cancelled, running tasks get up to `timeout` to finish and
    /// are killed afterwards. Emits [`PoolEvent::Shutdown`] once; later
    /// calls return an empty summary.
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownSummary {
        // Flag and queue change together so no freed worker can pick up queued work
        let queued: Vec<PendingTask> = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                debug!("Shutdown already requested");
                return ShutdownSummary::default();
            }
            state.shutting_down = true;
            state.queue.drain(..).collect()
        };
        info!("Initiating graceful shutdown");

        let cancelled = queued.len();
        for task in queued {
            self.inner.reject_cancelled(task);
        }

        // None means the deadline is beyond what Instant can represent: wait indefinitely
        let deadline = Instant::now().checked_add(timeout);

        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            // Register before checking so a wakeup between the two is not lost
            idle.as_mut().enable();

            if self.inner.state.lock().busy_count() == 0 {
                debug!("All workers idle");
                break;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, idle).await.is_err() {
                        break;
                    }
                }
                None => idle.await,
            }
        }

        let remaining = self.inner.state.lock().busy_count();
        let force_killed = if remaining > 0 {
            warn!(remaining, "Shutdown deadline reached, killing running processes");
            self.force_kill_all()
        } else {
            0
        };

        self.inner.events.emit(PoolEvent::Shutdown);
        info!(cancelled, force_killed, "Process pool shut down");

        ShutdownSummary {
            cancelled,
            force_killed,
        }
    }

    /// [`shutdown`](Self::shutdown) with the configured deadline
    pub async fn close(&self) -> ShutdownSummary {
        self.shutdown(self.inner.config.shutdown_timeout).await
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("stats", &self.stats())
            .field("circuit", &self.inner.breaker)
            .finish()
    }
}

impl PoolInner {
    fn bind(&self, state: &mut PoolState, index: usize, task: PendingTask) -> Dispatch {
        let kill = CancellationToken::new();
        let worker = &mut state.workers[index];
        worker.running = Some(RunningTask {
            task_id: task.id,
            kill: kill.clone(),
        });
        let worker_id = worker.id;

        debug!(task_id = %task.id, %worker_id, command = %task.request.command, "Task started");
        self.events.emit(PoolEvent::TaskStarted {
            task_id: task.id,
            worker_id,
        });

        Dispatch {
            worker_id,
            task,
            kill,
        }
    }

    fn launch(self: &Arc<Self>, dispatch: Dispatch) {
        tokio::spawn(run_task(Arc::clone(self), dispatch));
    }

    fn drain_queue(&self, state: &mut PoolState) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        if state.shutting_down {
            return dispatches;
        }
        while !state.queue.is_empty() {
            let Some(index) = state.idle_worker() else {
                break;
            };
            let Some(task) = state.queue.pop_front() else {
                break;
            };
            dispatches.push(self.bind(state, index, task));
        }
        dispatches
    }

    fn reject_cancelled(&self, task: PendingTask) {
        let task_id = task.id;
        debug!(%task_id, "Queued task cancelled");
        self.events.emit(PoolEvent::TaskCancelled { task_id });
        // The permit is dropped unsettled: cancellation says nothing about the binary
        let _ = task.reply.send(Err(PoolError::Cancelled { task_id }));
    }

    /// Record the outcome, free the worker and start queued work
    fn finish(
        self: &Arc<Self>,
        worker_id: WorkerId,
        task_id: TaskId,
        duration: Duration,
        result: &Result<ExecutionResult, PoolError>,
    ) {
        let mut state = self.state.lock();
        match result {
            Ok(execution) => {
                state.counters.record_completed(duration);
                debug!(%task_id, %worker_id, exit_code = ?execution.exit_code, ?duration, "Task completed");
                self.events.emit(PoolEvent::TaskCompleted {
                    task_id,
                    worker_id,
                    exit_code: execution.exit_code,
                    duration,
                });
            }
            Err(e) => {
                state.counters.record_failed();
                debug!(%task_id, %worker_id, kind = e.kind(), error = %e, "Task failed");
                self.events.emit(PoolEvent::TaskFailed {
                    task_id,
                    worker_id,
                    kind: e.kind(),
                });
            }
        }

        if let Some(index) = state.workers.iter().position(|w| w.id == worker_id) {
            if state.workers[index].retiring {
                state.workers.remove(index);
                debug!(%worker_id, "Retired worker removed");
            } else {
                state.workers[index].running = None;
            }
        }

        let dispatches = self.drain_queue(&mut state);
        let all_idle = state.busy_count() == 0;
        drop(state);

        for dispatch in dispatches {
            self.launch(dispatch);
        }
        if all_idle {
            self.idle.notify_waiters();
        }
    }
}

async fn run_task(inner: Arc<PoolInner>, dispatch: Dispatch) {
    let Dispatch {
        worker_id,
        task,
        kill,
    } = dispatch;
    let PendingTask {
        id: task_id,
        request,
        timeout,
        permit,
        reply,
    } = task;
    let command = request.command.clone();

    audit::dispatch(
        &inner.audit,
        AuditEvent::Launching {
            task_id,
            worker_id,
            command: request.command.clone(),
            args: request.args.clone(),
            at: Utc::now(),
        },
    );

    let started = Instant::now();
    let launcher = Arc::clone(&inner.launcher);
    let run_kill = kill.clone();
    // A separate task so a panicking launcher cannot leave the worker busy
    let mut run = tokio::spawn(async move { launcher.run(&request, run_kill).await });

    let outcome = tokio::select! {
        joined = &mut run => match joined {
            Ok(Ok(output)) => Outcome::Exited(output),
            Ok(Err(e)) => Outcome::LaunchFailed(e),
            Err(_) => Outcome::Aborted,
        },
        _ = tokio::time::sleep(timeout) => {
            kill.cancel();
            // Reap before the worker is reused
            let _ = run.await;
            Outcome::TimedOut
        }
    };
    let duration = started.elapsed();

    let result = match outcome {
        Outcome::Exited(output) => Ok(ExecutionResult {
            task_id,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration,
        }),
        Outcome::LaunchFailed(source) => {
            if let LaunchError::Spawn(e) = &source {
                audit::dispatch(
                    &inner.audit,
                    AuditEvent::SpawnFailed {
                        task_id,
                        worker_id,
                        command: command.clone(),
                        error: e.to_string(),
                        at: Utc::now(),
                    },
                );
            }
            Err(PoolError::Spawn { command, source })
        }
        Outcome::TimedOut => {
            warn!(
                %task_id,
                %worker_id,
                timeout_ms = timeout.as_millis() as u64,
                "Task timed out, process killed"
            );
            audit::dispatch(
                &inner.audit,
                AuditEvent::TimedOut {
                    task_id,
                    worker_id,
                    limit: timeout,
                    at: Utc::now(),
                },
            );
            Err(PoolError::Timeout {
                task_id,
                limit: timeout,
            })
        }
        Outcome::Aborted => Err(PoolError::Aborted { task_id }),
    };

    match &result {
        Ok(_) => permit.success(),
        Err(e) if e.counts_as_failure() => permit.failure(),
        Err(_) => drop(permit),
    }

    inner.finish(worker_id, task_id, duration, &result);
    let _ = reply.send(result);
}
