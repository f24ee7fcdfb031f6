//! Long-running commands restarted on failure with exponential backoff.

use crate::engine::platform::PlatformProcessManager;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Restarting,
    Failed,
    Stopped,
    Completed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Failed | ProcessStatus::Stopped | ProcessStatus::Completed)
    }
}

/// Point-in-time view of one keep-alive command.
#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveProcess {
    pub command: String,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub last_restart: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_restarts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_restarts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Delay before restart number `attempt` (1-based): doubles each time, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Supervises one command: spawn, watch, restart on non-zero exit.
#[derive(Debug)]
pub struct KeepAliveRunner {
    key: String,
    interpreter: String,
    platform: Arc<dyn PlatformProcessManager>,
    policy: BackoffPolicy,
    state: StdRwLock<KeepAliveProcess>,
    cancel: CancellationToken,
}

impl KeepAliveRunner {
    pub fn new(
        key: impl Into<String>,
        command: impl Into<String>,
        interpreter: impl Into<String>,
        platform: Arc<dyn PlatformProcessManager>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            key: key.into(),
            interpreter: interpreter.into(),
            platform,
            policy,
            state: StdRwLock::new(KeepAliveProcess {
                command: command.into(),
                status: ProcessStatus::Starting,
                restart_count: 0,
                last_restart: None,
                pid: None,
                started_at: None,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> KeepAliveProcess {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn update(&self, f: impl FnOnce(&mut KeepAliveProcess)) {
        f(&mut self.state.write().unwrap_or_else(PoisonError::into_inner));
    }

    fn finish(&self, status: ProcessStatus) -> ProcessStatus {
        self.update(|p| {
            p.status = status;
            p.pid = None;
        });
        status
    }

    /// Runs until the command completes, exhausts its restart budget or is stopped.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn run(&self) -> Result<ProcessStatus, AppError> {
        let command = self.snapshot().command;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(ProcessStatus::Stopped));
            }

            let mut cmd = TokioCommand::new(&self.interpreter);
            cmd.arg("-c").arg(&command).stdin(Stdio::null()).kill_on_drop(true);
            self.platform.setup(&mut cmd)?;
            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    self.finish(ProcessStatus::Failed);
                    return Err(AppError::Io(e));
                }
            };
            let pid = child.id();
            self.update(|p| {
                p.status = ProcessStatus::Running;
                p.pid = pid;
                p.started_at = Some(Utc::now());
            });
            info!(pid, command = %command, "Keep-alive process running");

            let exit = tokio::select! {
                status = child.wait() => status,
                _ = self.cancel.cancelled() => {
                    info!(pid, "Stopping keep-alive process");
                    self.platform.terminate(&mut child).await?;
                    return Ok(self.finish(ProcessStatus::Stopped));
                }
            };

            match exit {
                Ok(status) if status.success() => {
                    info!(pid, "Keep-alive process completed");
                    return Ok(self.finish(ProcessStatus::Completed));
                }
                Ok(status) => warn!(pid, code = ?status.code(), "Keep-alive process exited with failure"),
                Err(e) => warn!(pid, error = %e, "Failed to wait on keep-alive process"),
            }

            let restarts = self.snapshot().restart_count;
            if restarts >= self.policy.max_restarts {
                warn!(restarts, "Restart budget exhausted; giving up");
                return Ok(self.finish(ProcessStatus::Failed));
            }

            let attempt = restarts + 1;
            let delay = self.policy.delay_for(attempt);
            self.update(|p| {
                p.status = ProcessStatus::Restarting;
                p.restart_count = attempt;
                p.last_restart = Some(Utc::now());
                p.pid = None;
            });
            info!(attempt, ?delay, "Restarting keep-alive process after backoff");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(self.finish(ProcessStatus::Stopped)),
            }
        }
    }
}

/// A runner driven on its own task.
#[derive(Debug)]
pub struct KeepAliveHandle {
    runner: Arc<KeepAliveRunner>,
    task: JoinHandle<Result<ProcessStatus, AppError>>,
    finished: watch::Receiver<bool>,
}

impl KeepAliveHandle {
    pub fn spawn(runner: KeepAliveRunner) -> Self {
        let runner = Arc::new(runner);
        let (done, finished) = watch::channel(false);
        let task = {
            let runner = runner.clone();
            tokio::spawn(async move {
                let result = runner.run().await;
                done.send_replace(true);
                result
            })
        };
        Self { runner, task, finished }
    }

    pub fn snapshot(&self) -> KeepAliveProcess {
        self.runner.snapshot()
    }

    /// Flips to `true` once the runner returns. The sender is dropped if the task dies.
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished.clone()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow() || self.task.is_finished()
    }

    pub async fn join(self) -> Result<ProcessStatus, AppError> {
        let key = self.runner.key().to_string();
        self.task.await.map_err(|e| AppError::TaskFailed(key, e.to_string()))?
    }

    pub async fn stop(self) -> Result<ProcessStatus, AppError> {
        self.runner.stop();
        self.join().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_doubles_then_caps() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }

    #[test]
    fn terminal_states() {
        assert!(ProcessStatus::Failed.is_terminal());
        assert!(ProcessStatus::Completed.is_terminal());
        assert!(!ProcessStatus::Restarting.is_terminal());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::engine::platform;

        fn fast_policy(max_restarts: u32) -> BackoffPolicy {
            BackoffPolicy {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                max_restarts,
            }
        }

        #[tokio::test]
        async fn successful_command_completes_without_restart() {
            let runner = KeepAliveRunner::new("ok", "exit 0", "sh", platform::native(), fast_policy(3));
            assert_eq!(runner.run().await.unwrap(), ProcessStatus::Completed);
            let snap = runner.snapshot();
            assert_eq!(snap.restart_count, 0);
            assert!(snap.pid.is_none());
        }

        #[tokio::test]
        async fn failing_command_gives_up_after_budget() {
            let runner = KeepAliveRunner::new("bad", "exit 7", "sh", platform::native(), fast_policy(2));
            assert_eq!(runner.run().await.unwrap(), ProcessStatus::Failed);
            let snap = runner.snapshot();
            assert_eq!(snap.restart_count, 2);
            assert!(snap.last_restart.is_some());
        }

        #[tokio::test]
        async fn stop_moves_running_process_to_stopped() {
            let handle = KeepAliveHandle::spawn(KeepAliveRunner::new(
                "svc",
                "sleep 30",
                "sh",
                platform::native(),
                fast_policy(3),
            ));
            tokio::time::sleep(Duration::from_millis(150)).await;
            let snap = handle.snapshot();
            assert_eq!(snap.status, ProcessStatus::Running);
            assert!(snap.pid.is_some());

            assert_eq!(handle.stop().await.unwrap(), ProcessStatus::Stopped);
        }

        #[tokio::test]
        async fn completion_is_signalled_without_polling() {
            let handle = KeepAliveHandle::spawn(KeepAliveRunner::new("once", "exit 0", "sh", platform::native(), fast_policy(1)));
            let mut finished = handle.finished();
            assert!(!*finished.borrow());

            tokio::time::timeout(Duration::from_secs(2), finished.wait_for(|done| *done))
                .await
                .unwrap()
                .unwrap();
            assert!(handle.is_finished());
            assert_eq!(handle.join().await.unwrap(), ProcessStatus::Completed);
        }

        #[tokio::test]
        async fn stop_during_backoff_is_honored() {
            let policy = BackoffPolicy {
                initial_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                max_restarts: 3,
            };
            let handle = KeepAliveHandle::spawn(KeepAliveRunner::new("flappy", "exit 1", "sh", platform::native(), policy));
            tokio::time::sleep(Duration::from_millis(150)).await;
            assert_eq!(handle.snapshot().status, ProcessStatus::Restarting);

            let stopped = tokio::time::timeout(Duration::from_secs(2), handle.stop()).await.unwrap();
            assert_eq!(stopped.unwrap(), ProcessStatus::Stopped);
        }
    }
}
