use std::time::Duration;
use thiserror::Error;

/// One failed session inside a mass shutdown.
#[derive(Debug)]
pub struct SessionFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Empty command list for session '{0}'")]
    EmptyCommandList(String),

    #[error("Command segment must contain at least one command")]
    EmptySegment,

    #[error("SSH segment has an empty ssh command")]
    EmptySshCommand,

    #[error("Session '{0}' is already running")]
    DuplicateSession(String),

    #[error("Session not found for key: {0}")]
    SessionNotFound(String),

    #[error("Password prompt from '{0}' but no password was configured")]
    MissingPassword(String),

    #[error("Process handle is missing; cannot configure supervisor")]
    NullProcessHandle,

    #[error("Process creation is not permitted: {0}")]
    ProcessCreationForbidden(String),

    #[error("No usable script interpreter found (tried: {})", .0.join(", "))]
    InterpreterNotFound(Vec<String>),

    #[error("Invalid process-group id: {0}")]
    InvalidProcessGroup(i32),

    #[error("Failed to deliver {signal} to process group {pgid}: {source}")]
    SignalDelivery {
        signal: &'static str,
        pgid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Session '{0}' did not stop after forced kill")]
    ShutdownTimeout(String),

    #[error("Shutdown failed for {} session(s): {}", .0.len(), format_failures(.0))]
    AggregateShutdown(Vec<SessionFailure>),

    #[error("SSH authentication failed for '{0}'")]
    AuthenticationFailed(String),

    #[error("SSH session timed out after {0:?}")]
    SshTimeout(Duration),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Session '{key}' exited with status {code:?}")]
    SequenceFailed { key: String, code: Option<i32> },

    #[error("Background task for '{0}' failed: {1}")]
    TaskFailed(String, String),

    #[error("Workflow file error: {0}")]
    Workflow(String),

    #[error("Target not found in workflow: {0}")]
    TargetNotFound(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

fn format_failures(failures: &[SessionFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.key, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

const PROCESS_CREATION_PATTERNS: &[&str] = &[
    "operation not permitted",
    "resource temporarily unavailable",
    "cannot allocate memory",
    "fork/exec",
    "process creation is not permitted",
    "too many processes",
];

/// Returns true when an error message describes an inability to create child
/// processes, as opposed to a missing binary or bad input.
pub fn is_process_creation_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PROCESS_CREATION_PATTERNS.iter().any(|p| lower.contains(p))
}

impl AppError {
    /// Raw OS errors are classified where processes are spawned, which report
    /// a match as [`AppError::ProcessCreationForbidden`]. Anything else, file
    /// I/O included, is surfaced as-is.
    pub fn is_process_creation_failure(&self) -> bool {
        matches!(self, AppError::ProcessCreationForbidden(_))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Workflow(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_process_creation_errors_by_message() {
        assert!(is_process_creation_error("fork/exec /bin/bash: operation not permitted"));
        assert!(is_process_creation_error("Resource temporarily unavailable (os error 11)"));
        assert!(!is_process_creation_error("No such file or directory (os error 2)"));
        assert!(!is_process_creation_error("Session 'a' is already running"));
    }

    #[test]
    fn missing_interpreter_is_never_downgraded() {
        let err = AppError::InterpreterNotFound(vec!["bash".into(), "sh".into()]);
        assert!(!err.is_process_creation_failure());
        assert!(AppError::ProcessCreationForbidden("sandbox".into()).is_process_creation_failure());
    }

    #[test]
    fn io_errors_are_never_downgraded() {
        let denied = AppError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_process_creation_failure());
        #[cfg(unix)]
        {
            let eperm = AppError::Io(std::io::Error::from_raw_os_error(libc::EPERM));
            assert!(eperm.to_string().to_lowercase().contains("operation not permitted"));
            assert!(!eperm.is_process_creation_failure());
        }
    }

    #[test]
    fn aggregate_error_names_every_failed_key() {
        let err = AppError::AggregateShutdown(vec![
            SessionFailure { key: "a.b".into(), reason: "timeout".into() },
            SessionFailure { key: "c.d".into(), reason: "invalid".into() },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 session(s)"));
        assert!(text.contains("a.b: timeout"));
        assert!(text.contains("c.d: invalid"));
    }
}
