//! Drives one interactive `ssh` hop over a pseudo-terminal.
//!
//! The remote side is treated as an unstructured byte stream. A small state
//! machine ([`PromptMachine`]) watches for password and shell prompts and
//! decides what to type next; [`SshAutomaton`] does the I/O. Prompt
//! recognition is tuned for common bash/zsh prompts and is best effort on
//! anything more exotic.

use crate::engine::segmenter::{is_ssh_command, looks_like_shell_command, CommandSegment};
use crate::error::AppError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const MAX_BUFFER_BYTES: usize = 16 * 1024;
const TRIMMED_BUFFER_BYTES: usize = 4 * 1024;

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>]")
        .expect("static regex")
});

static SHELL_PROMPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[$#%>❯»λ]|➜\s+\S+)[ \t]*$").expect("static regex"));

const PASSWORD_PROMPTS: &[&str] = &["password:", "'s password:", "password for ", "passphrase for key"];
const AUTH_DENIED: &[&str] = &[
    "permission denied",
    "authentication failed",
    "access denied",
    "too many authentication failures",
];

pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Case-insensitive match on common password prompts.
pub fn is_password_prompt(output: &str) -> bool {
    let lower = output.to_lowercase();
    PASSWORD_PROMPTS.iter().any(|p| lower.contains(p))
}

pub fn is_auth_denied(output: &str) -> bool {
    let lower = output.to_lowercase();
    AUTH_DENIED.iter().any(|p| lower.contains(p))
}

/// True when the last line of `output` ends like a shell prompt.
pub fn is_shell_prompt(output: &str) -> bool {
    let last_line = output.rsplit(|c| c == '\n' || c == '\r').next().unwrap_or("");
    !last_line.trim().is_empty() && SHELL_PROMPT.is_match(last_line)
}

/// One command to type on the remote side. `password` answers the next
/// password prompt after it, for nested `ssh` hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStep {
    pub command: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHop {
    pub ssh_command: String,
    pub password: Option<String>,
    pub steps: Vec<RemoteStep>,
}

impl SshHop {
    pub fn new(ssh_command: impl Into<String>, password: Option<String>, remote_commands: Vec<String>) -> Self {
        Self {
            ssh_command: ssh_command.into(),
            password,
            steps: remote_commands
                .into_iter()
                .map(|command| RemoteStep { command, password: None })
                .collect(),
        }
    }

    /// Reads the hop out of a remote segment.
    pub fn from_segment(segment: &CommandSegment) -> Result<Self, AppError> {
        if !segment.is_ssh() {
            return Err(AppError::EmptySshCommand);
        }
        Self::from_commands(segment.commands())
    }

    /// Same as [`SshHop::from_segment`] for an already-split command list.
    pub fn from_commands(commands: &[String]) -> Result<Self, AppError> {
        let ssh_command = commands.first().map(|c| c.trim()).unwrap_or("");
        if ssh_command.is_empty() {
            return Err(AppError::EmptySshCommand);
        }

        let mut rest = commands[1..].iter().map(|c| c.trim().to_string()).peekable();
        let password = match rest.peek() {
            Some(next) if !looks_like_shell_command(next) && !is_ssh_command(next) => rest.next(),
            _ => None,
        };

        let mut steps = Vec::new();
        while let Some(command) = rest.next() {
            let nested_password = if is_ssh_command(&command) {
                match rest.peek() {
                    Some(next) if !looks_like_shell_command(next) && !is_ssh_command(next) => rest.next(),
                    _ => None,
                }
            } else {
                None
            };
            steps.push(RemoteStep { command, password: nested_password });
        }

        Ok(Self { ssh_command: ssh_command.to_string(), password, steps })
    }

    pub fn remote_commands(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.command.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomatonState {
    AwaitingPassword,
    AwaitingShellPrompt,
    SendingCommands,
    Exiting,
    Done,
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaction {
    /// Bytes to type, newline included.
    Send(String),
}

/// Prompt-driven state machine with no I/O of its own.
#[derive(Debug)]
pub struct PromptMachine {
    state: AutomatonState,
    label: String,
    buffer: String,
    password: Option<String>,
    password_sent: bool,
    queue: VecDeque<RemoteStep>,
    pending_password: Option<String>,
    last_prompt_at: Option<Instant>,
    settle: Duration,
    commands_sent: usize,
}

impl PromptMachine {
    pub fn new(hop: &SshHop, settle: Duration) -> Self {
        let state = if hop.password.is_some() {
            AutomatonState::AwaitingPassword
        } else {
            AutomatonState::AwaitingShellPrompt
        };
        Self {
            state,
            label: hop.ssh_command.clone(),
            buffer: String::new(),
            password: hop.password.clone(),
            password_sent: false,
            queue: hop.steps.iter().cloned().collect(),
            pending_password: None,
            last_prompt_at: None,
            settle,
            commands_sent: 0,
        }
    }

    pub fn state(&self) -> AutomatonState {
        self.state
    }

    pub fn commands_sent(&self) -> usize {
        self.commands_sent
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Appends fresh output and reacts to it.
    pub fn feed(&mut self, output: &str, now: Instant) -> Result<Option<Reaction>, AppError> {
        self.buffer.push_str(output);
        self.trim_buffer();
        self.evaluate(now)
    }

    /// Re-evaluates buffered output, e.g. once the settle delay has passed.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Reaction>, AppError> {
        self.evaluate(now)
    }

    /// Handles the remote side closing the stream.
    pub fn on_eof(&mut self) -> Result<(), AppError> {
        match self.state {
            AutomatonState::AwaitingPassword | AutomatonState::AwaitingShellPrompt => {
                let cleaned = strip_ansi(&self.buffer);
                if is_auth_denied(&cleaned) {
                    self.state = AutomatonState::AuthFailed;
                    return Err(AppError::AuthenticationFailed(self.label.clone()));
                }
                let last_line = cleaned.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
                Err(AppError::Pty(format!(
                    "connection '{}' closed before login completed: {}",
                    self.label, last_line
                )))
            }
            AutomatonState::AuthFailed => Err(AppError::AuthenticationFailed(self.label.clone())),
            _ => {
                self.state = AutomatonState::Done;
                Ok(())
            }
        }
    }

    /// Called once the connection has been torn down after `exit`.
    pub fn finish(&mut self) {
        if self.state == AutomatonState::Exiting {
            self.state = AutomatonState::Done;
        }
    }

    fn trim_buffer(&mut self) {
        if self.buffer.len() <= MAX_BUFFER_BYTES {
            return;
        }
        let mut cut = self.buffer.len() - TRIMMED_BUFFER_BYTES;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }

    fn settled(&self, now: Instant) -> bool {
        match self.last_prompt_at {
            Some(at) => now.saturating_duration_since(at) >= self.settle,
            None => true,
        }
    }

    fn send(&mut self, text: String, now: Instant) -> Option<Reaction> {
        self.buffer.clear();
        self.last_prompt_at = Some(now);
        Some(Reaction::Send(text))
    }

    fn evaluate(&mut self, now: Instant) -> Result<Option<Reaction>, AppError> {
        let cleaned = strip_ansi(&self.buffer);
        match self.state {
            AutomatonState::AwaitingPassword | AutomatonState::AwaitingShellPrompt => {
                if is_auth_denied(&cleaned) {
                    self.state = AutomatonState::AuthFailed;
                    return Err(AppError::AuthenticationFailed(self.label.clone()));
                }
                if is_password_prompt(&cleaned) {
                    if self.password_sent {
                        // asked again: the password was rejected
                        self.state = AutomatonState::AuthFailed;
                        return Err(AppError::AuthenticationFailed(self.label.clone()));
                    }
                    let Some(password) = self.password.clone() else {
                        return Err(AppError::MissingPassword(self.label.clone()));
                    };
                    self.password_sent = true;
                    self.state = AutomatonState::AwaitingShellPrompt;
                    debug!(target_host = %self.label, "Password prompt detected");
                    return Ok(self.send(format!("{}\n", password), now));
                }
                if is_shell_prompt(&cleaned) && self.settled(now) {
                    debug!(target_host = %self.label, "Shell prompt detected");
                    self.state = AutomatonState::SendingCommands;
                    return Ok(self.next_command(now));
                }
                Ok(None)
            }
            AutomatonState::SendingCommands => {
                if is_password_prompt(&cleaned) {
                    let Some(password) = self.pending_password.take() else {
                        return Err(AppError::MissingPassword(self.label.clone()));
                    };
                    return Ok(self.send(format!("{}\n", password), now));
                }
                if is_shell_prompt(&cleaned) && self.settled(now) {
                    return Ok(self.next_command(now));
                }
                Ok(None)
            }
            AutomatonState::Exiting | AutomatonState::Done | AutomatonState::AuthFailed => Ok(None),
        }
    }

    fn next_command(&mut self, now: Instant) -> Option<Reaction> {
        match self.queue.pop_front() {
            Some(step) => {
                self.pending_password = step.password;
                self.commands_sent += 1;
                self.send(format!("{}\n", step.command), now)
            }
            None => {
                self.state = AutomatonState::Exiting;
                self.send("exit\n".to_string(), now)
            }
        }
    }
}

/// Byte-stream side of a pseudo-terminal.
///
/// `read_chunk` must be cancel-safe; the driver races it against a timer.
#[async_trait]
pub trait PtyTransport: Send {
    /// Next chunk of output, `None` once the stream is closed.
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>>;

    async fn send(&mut self, data: &[u8]) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct AutomatonOptions {
    pub overall_timeout: Duration,
    pub prompt_settle: Duration,
    pub poll_interval: Duration,
    pub exit_grace: Duration,
}

impl Default for AutomatonOptions {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(30),
            prompt_settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
            exit_grace: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutomatonReport {
    pub commands_sent: usize,
    pub final_state: AutomatonState,
}

pub struct SshAutomaton<T: PtyTransport> {
    transport: T,
    machine: PromptMachine,
    options: AutomatonOptions,
    mirror: Option<Box<dyn Write + Send>>,
}

impl<T: PtyTransport + 'static> SshAutomaton<T> {
    pub fn new(transport: T, hop: &SshHop, options: AutomatonOptions) -> Self {
        Self {
            transport,
            machine: PromptMachine::new(hop, options.prompt_settle),
            options,
            mirror: None,
        }
    }

    /// Copies everything the remote side prints to `sink`.
    pub fn with_mirror(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(sink);
        self
    }

    /// Runs the exchange on its own task under the overall timeout.
    pub async fn run(self) -> Result<AutomatonReport, AppError> {
        let overall = self.options.overall_timeout;
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let _ = tx.send(self.drive().await);
        });

        match timeout(overall, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::Pty("automaton task ended without reporting".to_string())),
            Err(_) => {
                handle.abort();
                Err(AppError::SshTimeout(overall))
            }
        }
    }

    fn mirror(&mut self, bytes: &[u8]) {
        if let Some(sink) = self.mirror.as_mut() {
            if sink.write_all(bytes).and_then(|_| sink.flush()).is_err() {
                self.mirror = None;
            }
        }
    }

    async fn drive(mut self) -> Result<AutomatonReport, AppError> {
        loop {
            if self.machine.state() == AutomatonState::Exiting {
                self.drain_until_closed().await;
                self.machine.finish();
                break;
            }

            let read = tokio::select! {
                read = self.transport.read_chunk() => Some(read),
                _ = tokio::time::sleep(self.options.poll_interval) => None,
            };

            let reaction = match read {
                Some(Ok(Some(bytes))) => {
                    self.mirror(&bytes);
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.machine.feed(&text, Instant::now())?
                }
                Some(Ok(None)) => {
                    self.machine.on_eof()?;
                    break;
                }
                Some(Err(e)) => {
                    // EIO is how Linux reports the slave side going away.
                    debug!(error = %e, "PTY read failed; treating as closed stream");
                    self.machine.on_eof()?;
                    break;
                }
                None => self.machine.poll(Instant::now())?,
            };

            if let Some(Reaction::Send(text)) = reaction {
                self.transport
                    .send(text.as_bytes())
                    .await
                    .map_err(|e| AppError::Pty(format!("failed to write to PTY: {}", e)))?;
            }
        }

        Ok(AutomatonReport {
            commands_sent: self.machine.commands_sent(),
            final_state: self.machine.state(),
        })
    }

    async fn drain_until_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + self.options.exit_grace;
        loop {
            match tokio::time::timeout_at(deadline, self.transport.read_chunk()).await {
                Ok(Ok(Some(bytes))) => self.mirror(&bytes),
                Ok(Ok(None)) | Ok(Err(_)) => return,
                Err(_) => {
                    debug!("Remote side did not close after exit; giving up on teardown");
                    return;
                }
            }
        }
    }
}

/// `ssh` running on a local pseudo-terminal.
pub struct PortablePtyTransport {
    writer: Box<dyn Write + Send>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
}

impl PortablePtyTransport {
    pub fn spawn(ssh_command: &str) -> Result<Self, AppError> {
        let mut parts = ssh_command.split_whitespace();
        let program = parts.next().ok_or(AppError::EmptySshCommand)?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AppError::Pty(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(parts);
        cmd.env("TERM", "xterm-256color");
        cmd.env_remove(crate::engine::supervisor::SECRETS_ENV);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AppError::Pty(format!("Failed to spawn '{}': {}", program, e)))?;
        // Only the child may hold the slave, otherwise EOF never arrives.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AppError::Pty(format!("Failed to get PTY writer: {}", e)))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AppError::Pty(format!("Failed to get PTY reader: {}", e)))?;

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        info!(pid = ?child.process_id(), "Spawned ssh on PTY");
        Ok(Self {
            writer,
            output_rx,
            child,
            _master: pair.master,
        })
    }
}

#[async_trait]
impl PtyTransport for PortablePtyTransport {
    async fn read_chunk(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.output_rx.recv().await)
    }

    async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}

impl Drop for PortablePtyTransport {
    fn drop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!("Kill ssh child: {}", e);
        }
        if let Err(e) = self.child.wait() {
            debug!("Wait for ssh child: {}", e);
        }
    }
}

/// Spawns `ssh` on a PTY and automates the whole hop.
#[instrument(skip(hop, options, mirror), fields(ssh = %hop.ssh_command, steps = hop.steps.len()))]
pub async fn run_ssh_hop(
    hop: &SshHop,
    options: AutomatonOptions,
    mirror: Option<Box<dyn Write + Send>>,
) -> Result<AutomatonReport, AppError> {
    let transport = PortablePtyTransport::spawn(&hop.ssh_command)?;
    let mut automaton = SshAutomaton::new(transport, hop, options);
    if let Some(sink) = mirror {
        automaton = automaton.with_mirror(sink);
    }
    match automaton.run().await {
        Ok(report) => {
            info!(commands_sent = report.commands_sent, "SSH hop finished");
            Ok(report)
        }
        Err(e) => {
            warn!(error = %e, "SSH hop failed");
            Err(e)
        }
    }
}
