use crate::engine::keepalive::{KeepAliveProcess, ProcessStatus};
use crate::engine::session::SessionGroup;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex as StdMutex, PoisonError};
use sysinfo::{Pid, System};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessRole {
    Leader,
    Descendant,
    KeepAlive,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: Option<u32>,
    pub command: String,
    pub start_time: Option<DateTime<Utc>>,
    pub role: ProcessRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ProcessStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
}

impl ProcessInfo {
    pub fn for_leader(session: &SessionGroup) -> Self {
        let command = match session.script_path() {
            Some(path) => format!("{} {}", session.interpreter(), path.display()),
            None => session.interpreter().to_string(),
        };
        Self {
            pid: u32::try_from(session.session_id()).ok(),
            command,
            start_time: Some(session.start_time()),
            role: ProcessRole::Leader,
            status: None,
            restart_count: None,
        }
    }

    pub fn for_keep_alive(process: &KeepAliveProcess) -> Self {
        Self {
            pid: process.pid,
            command: process.command.clone(),
            start_time: process.started_at,
            role: ProcessRole::KeepAlive,
            status: Some(process.status),
            restart_count: Some(process.restart_count),
        }
    }
}

/// Walks the OS process table to find what a supervisor has spawned.
#[derive(Debug)]
pub struct ProcessSnapshotter {
    system: StdMutex<System>,
}

impl Default for ProcessSnapshotter {
    fn default() -> Self {
        Self {
            system: StdMutex::new(System::new()),
        }
    }
}

impl ProcessSnapshotter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Every live process below `root`, breadth first.
    pub fn descendants(&self, root: u32) -> Vec<ProcessInfo> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes();

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut found = Vec::new();
        let mut queue: VecDeque<Pid> = VecDeque::from([Pid::from_u32(root)]);
        while let Some(parent) = queue.pop_front() {
            let Some(kids) = children.get(&parent) else { continue };
            for pid in kids {
                let Some(process) = system.process(*pid) else { continue };
                let command = if process.cmd().is_empty() {
                    process.name().to_string()
                } else {
                    process.cmd().join(" ")
                };
                found.push(ProcessInfo {
                    pid: Some(pid.as_u32()),
                    command,
                    start_time: Utc.timestamp_opt(process.start_time() as i64, 0).single(),
                    role: ProcessRole::Descendant,
                    status: None,
                    restart_count: None,
                });
                queue.push_back(*pid);
            }
        }
        debug!(root, descendants = found.len(), "Process tree snapshot taken");
        found
    }
}
