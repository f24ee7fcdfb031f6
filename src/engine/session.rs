use crate::engine::segmenter::CommandSegment;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::process::Child;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Caller's stdio is handed to the supervisor; segments run one after another.
    Foreground,
    /// I/O is detached; lifecycle is driven through the registry and signals.
    #[default]
    Background,
}

impl std::str::FromStr for ExecutionMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "foreground" | "fg" => Ok(ExecutionMode::Foreground),
            "background" | "bg" => Ok(ExecutionMode::Background),
            _ => Err(AppError::Workflow(format!("Invalid execution mode: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    /// `None` when the leader was killed by a signal or could not be waited on.
    pub code: Option<i32>,
}

impl ExitOutcome {
    /// `Ok` only for a clean zero exit.
    pub fn into_result(self, key: &str) -> Result<(), AppError> {
        if self.code == Some(0) {
            Ok(())
        } else {
            Err(AppError::SequenceFailed {
                key: key.to_string(),
                code: self.code,
            })
        }
    }
}

/// A running supervised workflow: one leader process and its process group.
#[derive(Debug)]
pub struct SessionGroup {
    key: String,
    session_id: i32,
    process_group_id: i32,
    segments: Vec<CommandSegment>,
    mode: ExecutionMode,
    interpreter: String,
    script_path: Option<PathBuf>,
    start_time: DateTime<Utc>,
    completion: watch::Sender<Option<ExitOutcome>>,
    leader: StdMutex<Option<Child>>,
}

impl SessionGroup {
    /// Wraps a freshly spawned supervisor. The child must still be running.
    pub fn new(
        key: impl Into<String>,
        leader: Child,
        segments: Vec<CommandSegment>,
        mode: ExecutionMode,
        interpreter: impl Into<String>,
        script_path: Option<PathBuf>,
    ) -> Result<Self, AppError> {
        let pid = leader.id().ok_or(AppError::NullProcessHandle)? as i32;
        let (completion, _) = watch::channel(None);
        Ok(Self {
            key: key.into(),
            session_id: pid,
            process_group_id: pid,
            segments,
            mode,
            interpreter: interpreter.into(),
            script_path,
            start_time: Utc::now(),
            completion,
            leader: StdMutex::new(Some(leader)),
        })
    }

    /// A session with no leader handle, for exercising shutdown paths.
    #[cfg(test)]
    pub(crate) fn detached(key: &str, process_group_id: i32) -> Self {
        let (completion, _) = watch::channel(None);
        Self {
            key: key.to_string(),
            session_id: process_group_id,
            process_group_id,
            segments: Vec::new(),
            mode: ExecutionMode::Background,
            interpreter: "none".to_string(),
            script_path: None,
            start_time: Utc::now(),
            completion,
            leader: StdMutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn process_group_id(&self) -> i32 {
        self.process_group_id
    }

    pub fn segments(&self) -> &[CommandSegment] {
        &self.segments
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn interpreter(&self) -> &str {
        &self.interpreter
    }

    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Hands the leader to whoever will wait on it. Only the first call gets it.
    pub fn take_leader(&self) -> Option<Child> {
        self.leader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Closes the completion signal. Later calls keep the first outcome.
    pub fn mark_complete(&self, outcome: ExitOutcome) {
        self.completion.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    pub fn is_complete(&self) -> bool {
        self.completion.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<ExitOutcome> {
        *self.completion.borrow()
    }

    /// Resolves once the leader has exited.
    pub async fn wait_complete(&self) -> ExitOutcome {
        let mut rx = self.completion.subscribe();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        result.unwrap_or(ExitOutcome { code: None })
    }
}
