//! Pool provider
//!
//! Owns the application's default [`ProcessPool`]. Build one provider at
//! startup, share it with whatever needs a pool, and shut it down from the
//! top-level lifecycle.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::audit::{AuditSink, TracingAuditSink};
use crate::launcher::{ProcessLauncher, SystemLauncher};
use crate::pool::{PoolConfig, ProcessPool, ShutdownSummary};

/// Lazily constructed, rebuildable pool holder
///
/// [`get`](Self::get) builds the pool on first use. After
/// [`shutdown`](Self::shutdown) the next `get` builds a fresh pool from the
/// same configuration.
pub struct PoolProvider {
    config: PoolConfig,
    launcher: Arc<dyn ProcessLauncher>,
    audit: Arc<dyn AuditSink>,
    pool: Mutex<Option<ProcessPool>>,
}

impl PoolProvider {
    /// Provider for pools that spawn real processes
    pub fn new(config: PoolConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher::new()))
    }

    /// Provider whose pools use `launcher`
    pub fn with_launcher(config: PoolConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            launcher,
            audit: Arc::new(TracingAuditSink),
            pool: Mutex::new(None),
        }
    }

    /// Replace the audit sink used by pools built from now on
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The current pool, building it if needed
    ///
    /// A pool that was shut down through its own handle is replaced as well.
    pub fn get(&self) -> ProcessPool {
        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            if !pool.is_shutting_down() {
                return pool.clone();
            }
            debug!("Current pool is shutting down, building a new one");
        }

        let pool = ProcessPool::builder(self.config.clone())
            .launcher(Arc::clone(&self.launcher))
            .audit_sink(Arc::clone(&self.audit))
            .build();
        *slot = Some(pool.clone());
        pool
    }

    /// Whether a pool is currently held
    pub fn is_initialized(&self) -> bool {
        self.pool.lock().is_some()
    }

    /// Shut down and release the current pool
    ///
    /// Uses the configured shutdown deadline. Returns `None` when no pool
    /// was held.
    pub async fn shutdown(&self) -> Option<ShutdownSummary> {
        let pool = self.pool.lock().take()?;
        let summary = pool.shutdown(self.config.shutdown_timeout).await;
        info!(
            cancelled = summary.cancelled,
            force_killed = summary.force_killed,
            "Default pool released"
        );
        Some(summary)
    }
}

impl std::fmt::Debug for PoolProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolProvider")
            .field("launcher", &self.launcher.name())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{CommandRequest, LaunchError, ProcessOutput};
    use crate::pool::ExecOptions;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct EchoLauncher;

    #[async_trait]
    impl ProcessLauncher for EchoLauncher {
        async fn run(
            &self,
            request: &CommandRequest,
            _kill: CancellationToken,
        ) -> Result<ProcessOutput, LaunchError> {
            Ok(ProcessOutput {
                stdout: request.args.join(" "),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn provider() -> PoolProvider {
        PoolProvider::with_launcher(PoolConfig::default().with_max_workers(2), Arc::new(EchoLauncher))
    }

    #[tokio::test]
    async fn test_get_is_lazy_and_shared() {
        let provider = provider();
        assert!(!provider.is_initialized());

        let first = provider.get();
        let second = provider.get();
        assert!(provider.is_initialized());

        first.resize(3).unwrap();
        assert_eq!(second.stats().total_workers, 3);
    }

    #[tokio::test]
    async fn test_shutdown_without_pool_is_noop() {
        let provider = provider();
        assert_eq!(provider.shutdown().await, None);
        assert!(!provider.is_initialized());
    }

    #[tokio::test]
    async fn test_rebuilds_after_shutdown() {
        let provider = provider();
        let old = provider.get();
        old.resize(1).unwrap();

        let summary = provider.shutdown().await;
        assert_eq!(summary, Some(ShutdownSummary::default()));
        assert!(!provider.is_initialized());
        assert!(old.is_shutting_down());

        let fresh = provider.get();
        assert!(!fresh.is_shutting_down());
        assert_eq!(fresh.stats().total_workers, 2);

        let result = fresh
            .execute("tool", ["hello"], ExecOptions::default())
            .await
            .unwrap();
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_replaces_pool_closed_elsewhere() {
        let provider = provider();
        let pool = provider.get();
        pool.shutdown(std::time::Duration::from_millis(10)).await;

        let fresh = provider.get();
        assert!(!fresh.is_shutting_down());
    }
}
