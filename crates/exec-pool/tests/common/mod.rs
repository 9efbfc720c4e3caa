//! Shared fixtures for pool integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use exec_pool::{
    AuditEvent, AuditSink, CommandRequest, LaunchError, PoolConfig, ProcessLauncher,
    ProcessOutput, ProcessPool,
};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

/// Command that holds its "process" open until the test closes it
pub const HOLD: &str = "hold";
/// Command whose spawn always fails with `NotFound`
pub const MISSING: &str = "missing-binary";

/// In-memory launcher driven by the test
///
/// The first argument of each request is its label. `hold` processes stay
/// running until [`close`](Self::close) or a kill; `missing-binary` fails to
/// spawn; anything else exits 0 immediately, echoing its arguments.
#[derive(Default)]
pub struct ScriptedLauncher {
    invocations: AtomicUsize,
    killed: AtomicUsize,
    running: Mutex<HashMap<String, oneshot::Sender<i32>>>,
    changed: Notify,
}

impl ScriptedLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of times `run` was entered
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Number of held processes terminated through the kill token
    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, label: &str) -> bool {
        self.running.lock().contains_key(label)
    }

    /// Wait until a held process with `label` is running
    pub async fn wait_for(&self, label: &str) {
        loop {
            let changed = self.changed.notified();
            if self.is_running(label) {
                return;
            }
            changed.await;
        }
    }

    /// Let a held process exit with `code`
    pub fn close(&self, label: &str, code: i32) {
        let sender = self
            .running
            .lock()
            .remove(label)
            .unwrap_or_else(|| panic!("no running process labelled {label}"));
        sender.send(code).expect("process already gone");
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn run(
        &self,
        request: &CommandRequest,
        kill: CancellationToken,
    ) -> Result<ProcessOutput, LaunchError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let label = request.args.first().cloned().unwrap_or_default();

        match request.command.as_str() {
            MISSING => Err(LaunchError::Spawn(io::Error::from(io::ErrorKind::NotFound))),
            HOLD => {
                let (tx, rx) = oneshot::channel();
                self.running.lock().insert(label.clone(), tx);
                self.changed.notify_waiters();

                tokio::select! {
                    code = rx => Ok(ProcessOutput {
                        stdout: format!("{label} done"),
                        stderr: String::new(),
                        exit_code: code.ok(),
                    }),
                    _ = kill.cancelled() => {
                        self.running.lock().remove(&label);
                        self.killed.fetch_add(1, Ordering::SeqCst);
                        Ok(ProcessOutput {
                            stdout: format!("{label} partial"),
                            stderr: String::new(),
                            exit_code: None,
                        })
                    }
                }
            }
            _ => Ok(ProcessOutput {
                stdout: request.args.join(" "),
                stderr: String::new(),
                exit_code: Some(0),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "ScriptedLauncher"
    }
}

/// Audit sink that keeps every event
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingSink {
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(AuditEvent::event_type).collect()
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Pool wired to a scripted launcher
pub fn scripted_pool(config: PoolConfig) -> (ProcessPool, Arc<ScriptedLauncher>) {
    let launcher = ScriptedLauncher::new();
    let pool = ProcessPool::builder(config)
        .launcher(launcher.clone())
        .build();
    (pool, launcher)
}

/// Let spawned tasks run until the runtime has nothing left to do
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
