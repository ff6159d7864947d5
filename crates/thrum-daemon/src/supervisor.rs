//! Daemon Supervisor (C8, spec.md §4.8): per-repository singleton lock,
//! PID file, and the graceful-shutdown sequence.
//!
//! Grounded in the teacher's `daemon/socket.rs` `SocketServerHandle` (a
//! `Drop` impl that removes the socket/PID files, so cleanup runs even on
//! an early return or panic unwind) and `daemon/shutdown.rs`
//! `graceful_shutdown` (per-component timeout, aggregated success/
//! timeout/error counts, logged once at the end).

use crate::Layout;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thrum_core::error::{Result, ThrumError};
use thrum_core::io::{try_acquire_lock_once, FileLock};
use tokio::task::JoinHandle;

/// Budget for draining in-flight requests and background tasks on
/// shutdown (spec.md §4.8 "give in-flight requests up to 5s to complete").
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct PidFile {
    pid: u32,
    repo_path: PathBuf,
    socket_path: PathBuf,
    started_at: String,
}

/// Holds the process-lifetime singleton lock and the on-disk artifacts
/// (PID file, socket, chosen WebSocket port) that must be removed when the
/// daemon exits, by whatever path it exits. The safety net spec.md §4.8
/// asks for ("these steps run on any abnormal exit") is this `Drop` impl:
/// it runs even if `main` panics or returns early, since `Supervisor`
/// holding the lock is never leaked past that point.
pub struct Supervisor {
    _lock: FileLock,
    pid_path: PathBuf,
    socket_path: PathBuf,
    ws_port_path: PathBuf,
}

impl Supervisor {
    /// Acquires the singleton lock and writes the PID file. Fails with
    /// `ThrumError::AlreadyRunning` if another daemon already holds the
    /// lock for this repository (spec.md §4.8 "refuse to start").
    pub fn acquire(layout: &Layout, repo_path: &PathBuf) -> Result<Supervisor> {
        let lock_path = layout.lock_path();
        let lock = try_acquire_lock_once(&lock_path).map_err(|_| ThrumError::AlreadyRunning(lock_path.clone()))?;

        let pid_file = PidFile {
            pid: std::process::id(),
            repo_path: repo_path.clone(),
            socket_path: layout.socket_path(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        std::fs::write(layout.pid_path(), serde_json::to_string_pretty(&pid_file)?)?;

        Ok(Supervisor {
            _lock: lock,
            pid_path: layout.pid_path(),
            socket_path: layout.socket_path(),
            ws_port_path: layout.ws_port_path(),
        })
    }

    fn remove_runtime_files(&self) {
        for path in [&self.pid_path, &self.socket_path, &self.ws_port_path] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove runtime file on shutdown");
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.remove_runtime_files();
        // `_lock`'s own `Drop` releases the advisory lock after this runs.
    }
}

/// A background task this shutdown sequence waits on, with a human label
/// for the summary log.
pub struct ShutdownTask {
    pub label: &'static str,
    pub handle: JoinHandle<()>,
}

/// Aggregated outcome of one shutdown pass (SPEC_FULL.md §10.7), logged at
/// `info` once and returned so `main` can decide its exit code.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    stopped: u32,
    timed_out: u32,
    errored: u32,
}

impl ShutdownReport {
    pub fn had_problems(&self) -> bool {
        self.timed_out > 0 || self.errored > 0
    }

    pub fn log_summary(&self) {
        tracing::info!(
            stopped = self.stopped,
            timed_out = self.timed_out,
            errored = self.errored,
            "shutdown complete"
        );
    }
}

/// Runs the graceful shutdown sequence (spec.md §4.8): stop accepting new
/// connections (the caller cancels the shared token before calling this),
/// wait up to `SHUTDOWN_TIMEOUT` for each background task, record the
/// outcome, then the returned report's caller removes runtime files by
/// dropping its `Supervisor`.
pub async fn shutdown(tasks: Vec<ShutdownTask>) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for task in tasks {
        let label = task.label;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task.handle).await {
            Ok(Ok(())) => {
                tracing::info!(component = label, "stopped cleanly");
                report.stopped += 1;
            }
            Ok(Err(e)) => {
                tracing::error!(component = label, error = %e, "task panicked during shutdown");
                report.errored += 1;
            }
            Err(_) => {
                tracing::warn!(component = label, timeout = ?SHUTDOWN_TIMEOUT, "did not stop within shutdown budget");
                report.timed_out += 1;
            }
        }
    }

    report.log_summary();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_for_same_repo_fails_as_already_running() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path().join("thrum"));
        layout.ensure_dirs().unwrap();
        let repo_path = tmp.path().to_path_buf();

        let first = Supervisor::acquire(&layout, &repo_path).unwrap();
        let second = Supervisor::acquire(&layout, &repo_path);
        assert!(matches!(second, Err(ThrumError::AlreadyRunning(_))));
        drop(first);
    }

    #[test]
    fn pid_file_is_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path().join("thrum"));
        layout.ensure_dirs().unwrap();
        let repo_path = tmp.path().to_path_buf();

        let supervisor = Supervisor::acquire(&layout, &repo_path).unwrap();
        assert!(layout.pid_path().exists());
        drop(supervisor);
        assert!(!layout.pid_path().exists());
    }

    #[tokio::test]
    async fn shutdown_reports_timeout_for_a_hung_task() {
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let report = shutdown(vec![ShutdownTask { label: "hung", handle }]).await;
        assert!(report.had_problems());
    }
}
