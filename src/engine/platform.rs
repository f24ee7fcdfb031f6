//! OS-specific process-group creation and termination.

use crate::error::AppError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Grace period between a polite termination request and a forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl GroupSignal {
    pub fn name(&self) -> &'static str {
        match self {
            GroupSignal::Interrupt => "SIGINT",
            GroupSignal::Terminate => "SIGTERM",
            GroupSignal::Kill => "SIGKILL",
        }
    }

    #[cfg(unix)]
    fn as_raw(&self) -> libc::c_int {
        match self {
            GroupSignal::Interrupt => libc::SIGINT,
            GroupSignal::Terminate => libc::SIGTERM,
            GroupSignal::Kill => libc::SIGKILL,
        }
    }
}

#[async_trait]
pub trait PlatformProcessManager: Send + Sync + std::fmt::Debug {
    /// Puts an ordinary child into its own process group.
    fn setup(&self, command: &mut TokioCommand) -> Result<(), AppError>;

    /// Makes the child a session and process-group leader where the OS allows it.
    fn setup_supervisor(&self, command: Option<&mut TokioCommand>) -> Result<(), AppError>;

    /// Stops one child, escalating to a forced kill after [`TERMINATE_GRACE`].
    async fn terminate(&self, child: &mut Child) -> Result<(), AppError>;

    fn name(&self) -> &'static str;
}

/// Picks the implementation for the platform this binary was built for.
pub fn native() -> Arc<dyn PlatformProcessManager> {
    #[cfg(unix)]
    {
        Arc::new(UnixProcessManager::detect())
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsProcessManager)
    }
}

#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixProcessManager {
    /// macOS rejects setsid + setpgid on the same child with EPERM.
    combined_group_request: bool,
}

#[cfg(unix)]
impl UnixProcessManager {
    pub fn detect() -> Self {
        Self {
            combined_group_request: !cfg!(target_os = "macos"),
        }
    }

    pub fn requests_process_group(&self) -> bool {
        self.combined_group_request
    }
}

#[cfg(unix)]
#[async_trait]
impl PlatformProcessManager for UnixProcessManager {
    fn setup(&self, command: &mut TokioCommand) -> Result<(), AppError> {
        command.process_group(0);
        Ok(())
    }

    fn setup_supervisor(&self, command: Option<&mut TokioCommand>) -> Result<(), AppError> {
        let command = command.ok_or(AppError::NullProcessHandle)?;
        let combined = self.combined_group_request;
        // SAFETY: the closure runs in the forked child before exec and only
        // calls async-signal-safe functions.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                // setsid already made us group leader; only ask when it did not.
                if combined && libc::getpgrp() != libc::getpid() && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        Ok(())
    }

    async fn terminate(&self, child: &mut Child) -> Result<(), AppError> {
        let Some(pid) = child.id() else {
            debug!("Child already reaped; nothing to terminate");
            return Ok(());
        };

        let delivered = match signal_pid(pid as i32, GroupSignal::Terminate) {
            Ok(()) => true,
            Err(e) => {
                warn!(pid, error = %e, "Graceful termination signal failed; forcing kill");
                false
            }
        };

        if delivered {
            match timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(pid, ?status, "Child exited after SIGTERM");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(AppError::Io(e)),
                Err(_) => warn!(pid, "Child ignored SIGTERM; escalating to SIGKILL"),
            }
        }

        // kill() also waits, so no zombie is left behind.
        child.kill().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        if cfg!(target_os = "macos") {
            "macos"
        } else {
            "unix"
        }
    }
}

#[cfg(windows)]
#[derive(Debug, Clone, Default)]
pub struct WindowsProcessManager;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

#[cfg(windows)]
#[async_trait]
impl PlatformProcessManager for WindowsProcessManager {
    fn setup(&self, command: &mut TokioCommand) -> Result<(), AppError> {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        Ok(())
    }

    fn setup_supervisor(&self, command: Option<&mut TokioCommand>) -> Result<(), AppError> {
        let command = command.ok_or(AppError::NullProcessHandle)?;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        Ok(())
    }

    async fn terminate(&self, child: &mut Child) -> Result<(), AppError> {
        // No SIGTERM analogue for unrelated processes.
        child.kill().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "windows"
    }
}

#[cfg(unix)]
fn signal_pid(pid: i32, signal: GroupSignal) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal.as_raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Sends `signal` to every process in group `pgid`.
#[cfg(unix)]
pub fn signal_process_group(pgid: i32, signal: GroupSignal) -> Result<(), AppError> {
    if pgid <= 0 {
        return Err(AppError::InvalidProcessGroup(pgid));
    }
    // Negative pid addresses the whole group.
    signal_pid(-pgid, signal).map_err(|source| AppError::SignalDelivery {
        signal: signal.name(),
        pgid,
        source,
    })
}

#[cfg(windows)]
pub fn signal_process_group(pgid: i32, signal: GroupSignal) -> Result<(), AppError> {
    if pgid <= 0 {
        return Err(AppError::InvalidProcessGroup(pgid));
    }
    if signal == GroupSignal::Interrupt {
        return Ok(());
    }
    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pgid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|source| AppError::SignalDelivery { signal: signal.name(), pgid, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(AppError::SignalDelivery {
            signal: signal.name(),
            pgid,
            source: std::io::Error::new(std::io::ErrorKind::Other, format!("taskkill exited with {}", status)),
        })
    }
}

/// True if the group still has members we can see.
#[cfg(unix)]
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only performs the existence/permission check.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn process_group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    let mut system = sysinfo::System::new();
    system.refresh_processes();
    system.process(sysinfo::Pid::from_u32(pgid as u32)).is_some()
}

/// Platform-specific hint appended to process-creation failures.
pub fn process_creation_diagnostic(error: &std::io::Error) -> String {
    if cfg!(target_os = "macos") {
        format!(
            "{}. macOS refused to fork/exec; this usually means the caller runs inside an App Sandbox \
             or a restricted terminal. Run from a regular Terminal session or grant the host app \
             permission to launch processes.",
            error
        )
    } else if cfg!(target_os = "linux") {
        format!(
            "{}. Linux refused to create a process; check seccomp/container policy, the pids cgroup \
             limit and `ulimit -u` for this user.",
            error
        )
    } else {
        format!(
            "{}. The operating system refused to create a process; check sandbox restrictions and \
             per-user process limits.",
            error
        )
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Instant;

    #[test]
    fn supervisor_setup_requires_a_handle() {
        let platform = UnixProcessManager::detect();
        assert!(matches!(platform.setup_supervisor(None), Err(AppError::NullProcessHandle)));
    }

    #[test]
    fn macos_never_requests_both() {
        let platform = UnixProcessManager::detect();
        assert_eq!(platform.requests_process_group(), !cfg!(target_os = "macos"));
    }

    #[tokio::test]
    async fn supervisor_child_leads_its_own_group() {
        let platform = UnixProcessManager::detect();
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg("sleep 5").stdin(Stdio::null());
        platform.setup_supervisor(Some(&mut cmd)).unwrap();
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap() as i32;

        // SAFETY: plain syscalls on a pid we own.
        let (pgid, sid) = unsafe { (libc::getpgid(pid), libc::getsid(pid)) };
        assert_eq!(pgid, pid);
        assert_eq!(sid, pid);
        assert!(process_group_alive(pid));

        platform.terminate(&mut child).await.unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_is_ignored() {
        let platform = UnixProcessManager::detect();
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg("trap '' TERM; while :; do sleep 0.1; done");
        platform.setup(&mut cmd).unwrap();
        let mut child = cmd.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        platform.terminate(&mut child).await.unwrap();
        assert!(started.elapsed() >= TERMINATE_GRACE);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn rejects_non_positive_groups() {
        assert!(matches!(signal_process_group(0, GroupSignal::Terminate), Err(AppError::InvalidProcessGroup(0))));
        assert!(!process_group_alive(-3));
    }

    #[test]
    fn diagnostic_keeps_the_os_error() {
        let err = std::io::Error::from_raw_os_error(libc::EPERM);
        assert!(process_creation_diagnostic(&err).contains(&err.to_string()));
    }
}
