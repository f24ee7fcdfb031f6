//! Bridges OS interrupt delivery and the lifecycle of supervised sessions.

use crate::engine::platform::{self, signal_process_group, GroupSignal, TERMINATE_GRACE};
use crate::engine::registry::SessionRegistry;
use crate::engine::session::{ExecutionMode, ExitOutcome, SessionGroup};
use crate::error::{AppError, SessionFailure};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Extra headroom for a mass shutdown on top of the per-session worst case.
const SHUTDOWN_ALL_SLACK: Duration = Duration::from_secs(2);
const GROUP_POLL: Duration = Duration::from_millis(50);
/// How long background group members may outlive their leader before SIGKILL.
const ORPHAN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct SignalManager {
    dispatched: Arc<AtomicU64>,
}

impl SignalManager {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of signals successfully delivered to process groups so far.
    pub fn dispatched_signals(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }

    fn dispatch(&self, pgid: i32, signal: GroupSignal) -> Result<(), AppError> {
        signal_process_group(pgid, signal)?;
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        debug!(pgid, signal = signal.name(), "Signal delivered to process group");
        Ok(())
    }

    /// Waits for the session leader to exit, forwarding interrupt/terminate
    /// signals received by this process to the whole group meanwhile.
    /// Marks the session complete when the leader is reaped.
    #[instrument(skip(self, session), fields(key = %session.key(), pgid = session.process_group_id()))]
    pub async fn manage(&self, session: Arc<SessionGroup>) -> Result<ExitOutcome, AppError> {
        let Some(mut leader) = session.take_leader() else {
            return session.outcome().ok_or(AppError::NullProcessHandle);
        };
        let pgid = session.process_group_id();
        let mut listener = InterruptListener::install();

        let outcome = loop {
            tokio::select! {
                status = leader.wait() => {
                    break match status {
                        Ok(status) => ExitOutcome { code: status.code() },
                        Err(e) => {
                            warn!(error = %e, "Failed to wait on session leader");
                            ExitOutcome { code: None }
                        }
                    };
                }
                signal = listener.recv() => {
                    info!(signal = signal.name(), "Forwarding signal to session process group");
                    if let Err(e) = self.dispatch(pgid, signal) {
                        warn!(error = %e, "Signal forwarding failed");
                    }
                }
            }
        };

        info!(code = ?outcome.code, "Session leader exited");
        session.mark_complete(outcome);
        if session.mode() == ExecutionMode::Background {
            reap_orphans(pgid).await;
        }
        Ok(outcome)
    }

    /// Terminate, wait up to `timeout`, then kill and wait [`TERMINATE_GRACE`].
    /// Returns immediately if the session already completed.
    #[instrument(skip(self, session), fields(key = %session.key(), pgid = session.process_group_id()))]
    pub async fn graceful_shutdown(&self, session: &SessionGroup, timeout: Duration) -> Result<(), AppError> {
        if session.is_complete() {
            debug!("Session already complete; nothing to stop");
            return Ok(());
        }
        let pgid = session.process_group_id();
        if pgid <= 0 {
            return Err(AppError::InvalidProcessGroup(pgid));
        }

        let deadline = Instant::now() + timeout;
        if let Err(e) = self.dispatch(pgid, GroupSignal::Terminate) {
            warn!(error = %e, "Graceful termination signal failed");
        }
        if tokio::time::timeout(timeout, session.wait_complete()).await.is_ok() {
            // Leader is gone; members that outlive it get the rest of the window.
            while platform::process_group_alive(pgid) && Instant::now() < deadline {
                tokio::time::sleep(GROUP_POLL).await;
            }
            if platform::process_group_alive(pgid) {
                warn!("Group members outlived the leader; sending SIGKILL");
                if let Err(e) = self.dispatch(pgid, GroupSignal::Kill) {
                    debug!(error = %e, "SIGKILL to lingering group failed");
                }
            }
            info!("Session stopped after SIGTERM");
            return Ok(());
        }

        warn!(?timeout, "Session ignored SIGTERM; escalating to SIGKILL");
        let kill_result = self.dispatch(pgid, GroupSignal::Kill);
        if tokio::time::timeout(TERMINATE_GRACE, session.wait_complete()).await.is_ok() {
            info!("Session stopped after SIGKILL");
            return Ok(());
        }

        match kill_result {
            Err(e) => Err(e),
            Ok(()) => Err(AppError::ShutdownTimeout(session.key().to_string())),
        }
    }

    /// Shuts every registered session down concurrently and reports every
    /// failure, not just the first.
    #[instrument(skip(self, registry), fields(sessions = registry.count()))]
    pub async fn shutdown_all_sessions(&self, registry: &SessionRegistry, timeout: Duration) -> Result<(), AppError> {
        let sessions = registry.all();
        if sessions.is_empty() {
            return Ok(());
        }

        let mut pending: BTreeSet<String> = sessions.iter().map(|s| s.key().to_string()).collect();
        let mut failures = Vec::new();
        let mut tasks = JoinSet::new();
        for session in sessions {
            let manager = self.clone();
            tasks.spawn(async move {
                let result = manager.graceful_shutdown(&session, timeout).await;
                (session.key().to_string(), result)
            });
        }

        let overall = timeout + TERMINATE_GRACE + SHUTDOWN_ALL_SLACK;
        let collect = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((key, result)) => {
                        pending.remove(&key);
                        if let Err(e) = result {
                            failures.push(SessionFailure { key, reason: e.to_string() });
                        }
                    }
                    Err(e) => warn!(error = %e, "Shutdown task panicked"),
                }
            }
        };
        if tokio::time::timeout(overall, collect).await.is_err() {
            warn!(?overall, "Mass shutdown exceeded its overall timeout");
            tasks.abort_all();
        }

        for key in pending {
            failures.push(SessionFailure {
                key,
                reason: "shutdown did not finish".to_string(),
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by(|a, b| a.key.cmp(&b.key));
            Err(AppError::AggregateShutdown(failures))
        }
    }

    pub fn is_process_group_alive(&self, pid: i32) -> bool {
        platform::process_group_alive(pid)
    }
}

/// Once a background leader is gone nothing else can reach its group, so
/// members still running after [`ORPHAN_GRACE`] are killed.
async fn reap_orphans(pgid: i32) {
    let deadline = Instant::now() + ORPHAN_GRACE;
    while platform::process_group_alive(pgid) && Instant::now() < deadline {
        tokio::time::sleep(GROUP_POLL).await;
    }
    if platform::process_group_alive(pgid) {
        warn!(pgid, "Group members outlived the session leader; sending SIGKILL");
        if let Err(e) = signal_process_group(pgid, GroupSignal::Kill) {
            debug!(pgid, error = %e, "SIGKILL to orphaned group failed");
        }
    }
}

/// Interrupt/terminate listener that lives for one `manage` call.
#[cfg(unix)]
struct InterruptListener {
    interrupt: Option<tokio::signal::unix::Signal>,
    terminate: Option<tokio::signal::unix::Signal>,
}

#[cfg(unix)]
impl InterruptListener {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let open = |kind: SignalKind, name: &str| match signal(kind) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(signal = name, error = %e, "Cannot listen for signal; it will not be forwarded");
                None
            }
        };
        Self {
            interrupt: open(SignalKind::interrupt(), "SIGINT"),
            terminate: open(SignalKind::terminate(), "SIGTERM"),
        }
    }

    async fn recv(&mut self) -> GroupSignal {
        async fn next(stream: &mut Option<tokio::signal::unix::Signal>) {
            let Some(stream) = stream else {
                return std::future::pending::<()>().await;
            };
            if stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        tokio::select! {
            _ = next(&mut self.interrupt) => GroupSignal::Interrupt,
            _ = next(&mut self.terminate) => GroupSignal::Terminate,
        }
    }
}

#[cfg(windows)]
struct InterruptListener;

#[cfg(windows)]
impl InterruptListener {
    fn install() -> Self {
        InterruptListener
    }

    async fn recv(&mut self) -> GroupSignal {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        GroupSignal::Interrupt
    }
}
