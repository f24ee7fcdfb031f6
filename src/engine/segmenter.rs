//! Splits a flat command list into local and remote (SSH) runs.
//!
//! Classification is string heuristics only. A password that happens to look
//! like a shell command (for example one starting with `cd `) is treated as a
//! remote command; there is no escape syntax for that case.

use crate::error::AppError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentType {
    Local,
    RemoteSsh,
}

/// A contiguous run of commands sharing one execution mode.
///
/// For [`SegmentType::RemoteSsh`], element 0 is the ssh invocation, element 1
/// is a password when it does not look like a shell command, and the rest are
/// remote commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSegment {
    segment_type: SegmentType,
    commands: Vec<String>,
}

impl CommandSegment {
    pub fn new(segment_type: SegmentType, commands: Vec<String>) -> Result<Self, AppError> {
        if commands.is_empty() {
            return Err(AppError::EmptySegment);
        }
        if segment_type == SegmentType::RemoteSsh && commands[0].trim().is_empty() {
            return Err(AppError::EmptySshCommand);
        }
        Ok(Self { segment_type, commands })
    }

    pub fn segment_type(&self) -> SegmentType {
        self.segment_type
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn is_ssh(&self) -> bool {
        self.segment_type == SegmentType::RemoteSsh
    }

    fn push(&mut self, command: String) {
        self.commands.push(command);
    }
}

// First words that mark a token as a shell command rather than a password.
const SHELL_VERBS: &[&str] = &[
    "cd", "ls", "pwd", "echo", "printf", "cat", "less", "more", "head", "tail", "grep", "find",
    "export", "source", ".", "sudo", "su", "mkdir", "rm", "rmdir", "cp", "mv", "ln", "touch",
    "chmod", "chown", "vi", "vim", "nano", "git", "docker", "docker-compose", "kubectl", "helm",
    "make", "npm", "npx", "yarn", "pnpm", "cargo", "go", "python", "python3", "pip", "node",
    "java", "ruby", "bundle", "systemctl", "service", "journalctl", "ps", "top", "htop", "kill",
    "pkill", "curl", "wget", "tar", "unzip", "zip", "ssh", "scp", "rsync", "exit", "clear",
    "whoami", "env", "set", "unset", "alias", "which", "history", "df", "du", "free", "uname",
    "sleep", "tmux", "screen", "bash", "sh", "zsh", "exec", "watch", "tee", "awk", "sed", "xargs",
    "true", "false", "test", "[", "psql", "mysql", "redis-cli",
];

// First words that pull a command back to the local machine after an SSH run.
const LOCAL_MARKERS: &[&str] = &["echo", "printf", "sleep", "open", "code", "osascript", "notify-send", "say"];

static ENV_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=\S*").expect("static regex"));

fn first_word(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("")
}

/// True for an `ssh` invocation (`ssh user@host`, `ssh -p 22 host`).
pub fn is_ssh_command(command: &str) -> bool {
    let trimmed = command.trim();
    trimmed.starts_with("ssh ") || trimmed.starts_with("ssh\t")
}

/// Best-effort guess whether `command` is a shell command rather than a secret.
pub fn looks_like_shell_command(command: &str) -> bool {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('/') || trimmed.starts_with("./") || trimmed.starts_with("../") || trimmed.starts_with('~') {
        return true;
    }
    if ENV_ASSIGNMENT.is_match(trimmed) {
        return true;
    }
    SHELL_VERBS.contains(&first_word(trimmed))
}

/// True when a command clearly belongs to the local machine even right after an SSH hop.
pub fn is_local_marker(command: &str) -> bool {
    LOCAL_MARKERS.contains(&first_word(command.trim()))
}

/// Groups raw commands into segments, left to right.
///
/// Blank entries are skipped. An ssh command opens a new remote segment,
/// except directly after a bare ssh invocation where it extends the jump
/// chain. Inside a remote segment every command is remote until a local
/// marker is seen.
pub fn segment_commands(commands: &[String]) -> Result<Vec<CommandSegment>, AppError> {
    let mut segments: Vec<CommandSegment> = Vec::new();

    for raw in commands {
        let command = raw.trim();
        if command.is_empty() {
            continue;
        }

        let open_ssh = segments.last().filter(|s| s.is_ssh()).map(|s| s.commands.len());

        if is_ssh_command(command) {
            match (open_ssh, segments.last_mut()) {
                (Some(1), Some(current)) => current.push(command.to_string()),
                _ => segments.push(CommandSegment::new(SegmentType::RemoteSsh, vec![command.to_string()])?),
            }
            continue;
        }

        match (open_ssh, segments.last_mut()) {
            (Some(len), Some(current)) if len == 1 && !looks_like_shell_command(command) => {
                // password for the hop just opened
                current.push(command.to_string());
            }
            (Some(_), Some(current)) if !is_local_marker(command) => {
                current.push(command.to_string());
            }
            (None, Some(current)) => current.push(command.to_string()),
            _ => segments.push(CommandSegment::new(SegmentType::Local, vec![command.to_string()])?),
        }
    }

    Ok(segments)
}
