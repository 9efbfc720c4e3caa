//! Process launching
//!
//! [`ProcessLauncher`] is the seam between the pool's bookkeeping and the
//! operating system. [`SystemLauncher`] spawns real child processes; tests
//! substitute scripted launchers.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fully resolved invocation handed to a launcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory; inherits the pool's when `None`
    pub cwd: Option<PathBuf>,
    /// Variables added on top of the inherited environment
    pub env: HashMap<String, String>,
}

/// Captured output of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

/// Launch failures
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The process could not be started (missing binary, permissions, bad cwd)
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    /// The process started but its output or exit status could not be collected
    #[error("process I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl LaunchError {
    /// Underlying OS error
    pub fn io_error(&self) -> &io::Error {
        match self {
            Self::Spawn(e) | Self::Io(e) => e,
        }
    }
}

/// Runs one process to completion
///
/// Implementations must kill the process and return promptly once `kill` is
/// cancelled; the pool relies on this for timeouts and forced shutdown.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn run(
        &self,
        request: &CommandRequest,
        kill: CancellationToken,
    ) -> Result<ProcessOutput, LaunchError>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str {
        "ProcessLauncher"
    }
}

/// Spawns real child processes with `tokio::process`
///
/// No shell is involved: the command is executed directly with its
/// arguments. Stdin is closed; stdout and stderr are captured as UTF-8.
#[derive(Debug, Clone, Default)]
pub struct SystemLauncher;

impl SystemLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn run(
        &self,
        request: &CommandRequest,
        kill: CancellationToken,
    ) -> Result<ProcessOutput, LaunchError> {
        let mut command = Command::new(&request.command);
        command
            .args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        debug!(command = %request.command, pid = ?child.id(), "Spawned child process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();

        // Buffers outlive the collecting future so partial output survives a kill
        let status = {
            let collect = async {
                tokio::try_join!(
                    read_into(stdout, &mut stdout_buf),
                    read_into(stderr, &mut stderr_buf)
                )?;
                child.wait().await
            };
            tokio::select! {
                status = collect => Some(status),
                _ = kill.cancelled() => None,
            }
        };

        let exit_code = match status {
            Some(status) => status.map_err(LaunchError::Io)?.code(),
            None => {
                debug!(command = %request.command, "Killing child process");
                child.kill().await.map_err(LaunchError::Io)?;
                None
            }
        };

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
            exit_code,
        })
    }

    fn name(&self) -> &'static str {
        "SystemLauncher"
    }
}

async fn read_into<R>(stream: Option<R>, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let Some(mut stream) = stream {
        stream.read_to_end(buf).await?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(command: &str, args: &[&str]) -> CommandRequest {
        CommandRequest {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let output = SystemLauncher
            .run(&request("echo", &["hello"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let output = SystemLauncher
            .run(&request("sh", &["-c", "echo oops 1>&2; exit 3"]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stderr, "oops\n");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = SystemLauncher
            .run(
                &request("definitely-not-a-real-binary-7f3a", &[]),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
        assert_eq!(err.io_error().kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request("sh", &["-c", "printf '%s:' \"$GREETING\"; pwd"]);
        req.env.insert("GREETING".to_string(), "hi".to_string());
        req.cwd = Some(dir.path().to_path_buf());

        let output = SystemLauncher.run(&req, CancellationToken::new()).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(output.stdout.starts_with("hi:"));
        assert!(output.stdout.trim_end().ends_with(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_kill_token_terminates_process() {
        let kill = CancellationToken::new();
        let trigger = kill.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let output = SystemLauncher
            .run(&request("sleep", &["30"]), kill)
            .await
            .unwrap();
        assert_eq!(output.exit_code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
