//! End-to-end tests spawning real processes through SystemLauncher
//!
//! Unix only; relies on `sh`, `echo` and `sleep` being on PATH.

#![cfg(unix)]

use std::time::Duration;

use exec_pool::{ExecOptions, PoolConfig, PoolError, ProcessPool};

fn pool(workers: usize) -> ProcessPool {
    ProcessPool::new(
        PoolConfig::default()
            .with_max_workers(workers)
            .with_max_queue_size(10)
            .with_task_timeout(Duration::from_secs(10)),
    )
}

#[test_log::test(tokio::test)]
async fn test_runs_real_command() {
    let pool = pool(2);

    let result = pool
        .execute("echo", ["hello", "world"], ExecOptions::default())
        .await
        .unwrap();

    assert_eq!(result.stdout.trim(), "hello world");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(pool.stats().completed_tasks, 1);
}

#[tokio::test]
async fn test_exit_code_and_stderr_are_reported() {
    let pool = pool(1);

    let result = pool
        .execute("sh", ["-c", "echo oops >&2; exit 4"], ExecOptions::default())
        .await;

    // Shell syntax in an argument is refused before anything runs
    assert!(matches!(result, Err(PoolError::Validation(_))));

    let result = pool
        .execute("sh", ["-c", "exit 4"], ExecOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, Some(4));
    assert_eq!(pool.stats().failed_tasks, 0);
}

#[tokio::test]
async fn test_missing_binary_is_spawn_error() {
    let pool = pool(1);

    let err = pool
        .execute("definitely-not-an-engine-binary", ["--version"], ExecOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "spawn");
    assert_eq!(pool.stats().failed_tasks, 1);
    assert_eq!(pool.circuit_stats().total_failures, 1);
}

#[tokio::test]
async fn test_cwd_and_env_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("project.godot"), "config_version=5\n").unwrap();
    let pool = pool(1);

    let result = pool
        .execute(
            "cat",
            ["project.godot"],
            ExecOptions::new().with_cwd(dir.path()),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "config_version=5\n");

    let result = pool
        .execute(
            "printenv",
            ["ENGINE_MODE"],
            ExecOptions::new().with_env("ENGINE_MODE", "headless"),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "headless");
}

#[tokio::test]
async fn test_slow_process_times_out() {
    let pool = pool(1);

    let err = pool
        .execute(
            "sleep",
            ["5"],
            ExecOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Timeout { .. }));
    assert_eq!(pool.stats().busy_workers, 0);
}

#[tokio::test]
async fn test_shutdown_kills_long_running_process() {
    let pool = pool(1);
    let handle = pool
        .submit("sleep", ["5"], ExecOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let summary = pool.shutdown(Duration::from_millis(100)).await;
    assert_eq!(summary.force_killed, 1);

    let result = handle.await.unwrap();
    assert_eq!(result.exit_code, None);
}

#[tokio::test]
async fn test_unbounded_shutdown_lets_process_finish() {
    let pool = pool(1);
    let handle = pool
        .submit("sleep", ["1"], ExecOptions::default())
        .unwrap();

    let summary = pool.shutdown(Duration::MAX).await;
    assert_eq!(summary.force_killed, 0);

    let result = handle.await.unwrap();
    assert_eq!(result.exit_code, Some(0));
}
