//! Turns segments into one supervisor script and launches it as a session leader.

use crate::config::Config;
use crate::engine::platform::{process_creation_diagnostic, PlatformProcessManager};
use crate::engine::segmenter::{CommandSegment, SegmentType};
use crate::engine::session::{ExecutionMode, SessionGroup};
use crate::engine::ssh_automaton::SshHop;
use crate::error::{is_process_creation_error, AppError};
use crate::utils::path_utils::{ensure_private_dir, sanitize_for_file_name};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio as StdProcessStdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Environment variable carrying [`HopSecrets`] into `ssh-exec`.
pub const SECRETS_ENV: &str = "HOPSMITH_SSH_SECRETS";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const MASK: &str = "********";

/// Passwords for one hop, kept out of the helper's argv.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HopSecrets {
    pub password: Option<String>,
    /// Aligned with the hop's remote steps.
    #[serde(default)]
    pub nested: Vec<Option<String>>,
}

impl HopSecrets {
    pub fn from_hop(hop: &SshHop) -> Self {
        Self {
            password: hop.password.clone(),
            nested: hop.steps.iter().map(|s| s.password.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none() && self.nested.iter().all(Option::is_none)
    }

    /// Rebuilds the hop `ssh-exec` was asked to drive.
    pub fn into_hop(self, ssh_command: String, remote_commands: Vec<String>) -> SshHop {
        let mut hop = SshHop::new(ssh_command, self.password, remote_commands);
        for (step, password) in hop.steps.iter_mut().zip(self.nested) {
            step.password = password;
        }
        hop
    }
}

/// Quotes `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Debug, Clone)]
pub struct RenderedScript {
    pub text: String,
    secrets: Vec<String>,
}

impl RenderedScript {
    /// Script text with every embedded secret replaced, for display.
    pub fn masked(&self) -> String {
        let mut text = self.text.clone();
        for secret in &self.secrets {
            text = text.replace(secret.as_str(), MASK);
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    mode: ExecutionMode,
    helper_bin: PathBuf,
    ssh_timeout: Duration,
    prompt_settle: Duration,
}

impl ScriptBuilder {
    pub fn new(mode: ExecutionMode, helper_bin: PathBuf, ssh_timeout: Duration, prompt_settle: Duration) -> Self {
        Self {
            mode,
            helper_bin,
            ssh_timeout,
            prompt_settle,
        }
    }

    pub fn render(&self, key: &str, segments: &[CommandSegment]) -> Result<RenderedScript, AppError> {
        if segments.is_empty() {
            return Err(AppError::EmptyCommandList(key.to_string()));
        }

        let background = self.mode == ExecutionMode::Background;
        let mut secrets = Vec::new();
        let mut out = String::new();
        out.push_str("#!/bin/sh\n");
        out.push_str(&format!("# hopsmith supervisor for session {}\n", shell_quote(key)));
        out.push_str("set -e\n");

        if background {
            out.push_str(concat!(
                "HS_PIDS=\"\"\n",
                "__hs_stop_group() {\n",
                "  trap '' INT TERM\n",
                "  trap - EXIT\n",
                "  kill -TERM -$$ 2>/dev/null || true\n",
                "}\n",
                "__hs_reap_jobs() {\n",
                "  trap '' INT TERM\n",
                "  for __hs_pid in $HS_PIDS; do\n",
                "    kill \"$__hs_pid\" 2>/dev/null || true\n",
                "  done\n",
                "  kill -TERM -$$ 2>/dev/null || true\n",
                "}\n",
                "trap '__hs_stop_group; exit 130' INT\n",
                "trap '__hs_stop_group; exit 143' TERM\n",
                "trap '__hs_reap_jobs' EXIT\n",
            ));
        }

        let mut pid_vars = Vec::new();
        for (index, segment) in segments.iter().enumerate() {
            let n = index + 1;
            let job = match segment.segment_type() {
                SegmentType::Local => {
                    out.push_str(&format!("# segment {}: local\n", n));
                    format!("( {} )", segment.commands().join(" && "))
                }
                SegmentType::RemoteSsh => {
                    let hop = SshHop::from_segment(segment)?;
                    out.push_str(&format!("# segment {}: remote-ssh\n", n));
                    let secrets_for_hop = HopSecrets::from_hop(&hop);
                    secrets.extend(secrets_for_hop.password.iter().cloned());
                    secrets.extend(secrets_for_hop.nested.iter().flatten().cloned());
                    self.helper_invocation(&hop, &secrets_for_hop)?
                }
            };

            if background {
                let var = format!("HS_SEGMENT_{}_PID", n);
                out.push_str(&format!("{} &\n{}=$!\nHS_PIDS=\"$HS_PIDS ${}\"\n", job, var, var));
                pid_vars.push(var);
            } else {
                out.push_str(&job);
                out.push('\n');
            }
        }

        if background {
            for var in &pid_vars {
                out.push_str(&format!("wait \"${}\"\n", var));
            }
            out.push_str("wait\n");
        }

        // longest first so a secret containing another is masked whole
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.retain(|s| !s.is_empty());
        Ok(RenderedScript { text: out, secrets })
    }

    fn helper_invocation(&self, hop: &SshHop, secrets: &HopSecrets) -> Result<String, AppError> {
        let mut parts = Vec::new();
        if !secrets.is_empty() {
            parts.push(format!("{}={}", SECRETS_ENV, shell_quote(&serde_json::to_string(secrets)?)));
        }
        parts.push(shell_quote(&self.helper_bin.to_string_lossy()));
        parts.push("ssh-exec".to_string());
        parts.push(format!("--timeout-secs {}", self.ssh_timeout.as_secs().max(1)));
        parts.push(format!("--settle-ms {}", self.prompt_settle.as_millis()));
        parts.push("--".to_string());
        parts.push(shell_quote(&hop.ssh_command));
        parts.extend(hop.remote_commands().map(shell_quote));
        Ok(parts.join(" "))
    }
}

/// True if an I/O error means the OS refused to create a process at all.
fn io_error_is_process_creation(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        if matches!(err.raw_os_error(), Some(libc::EPERM) | Some(libc::EAGAIN) | Some(libc::ENOMEM)) {
            return true;
        }
    }
    is_process_creation_error(&err.to_string())
}

#[derive(Debug)]
pub struct SupervisorBuilder {
    config: Arc<Config>,
    platform: Arc<dyn PlatformProcessManager>,
    creation_verified: AtomicBool,
}

impl SupervisorBuilder {
    pub fn new(config: Arc<Config>, platform: Arc<dyn PlatformProcessManager>) -> Self {
        Self {
            config,
            platform,
            creation_verified: AtomicBool::new(false),
        }
    }

    pub fn script_builder(&self, mode: ExecutionMode) -> Result<ScriptBuilder, AppError> {
        let helper_bin = match &self.config.helper_bin {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        Ok(ScriptBuilder::new(mode, helper_bin, self.config.ssh_timeout, self.config.prompt_settle))
    }

    /// Interpreters from the config that exist on PATH, in preference order.
    pub fn available_interpreters(&self) -> Vec<(String, PathBuf)> {
        self.config
            .interpreters
            .iter()
            .filter_map(|name| match which::which(name) {
                Ok(path) => Some((name.clone(), path)),
                Err(_) => {
                    debug!(interpreter = %name, "Interpreter not found on PATH");
                    None
                }
            })
            .collect()
    }

    /// Spawns a trivial process once to make sure the sandbox allows it.
    pub async fn verify_process_creation(&self, interpreter: &Path) -> Result<(), AppError> {
        if self.creation_verified.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut probe = TokioCommand::new(interpreter);
        probe
            .arg("-c")
            .arg("exit 0")
            .stdin(StdProcessStdio::null())
            .stdout(StdProcessStdio::null())
            .stderr(StdProcessStdio::null());

        let mut child = match probe.spawn() {
            Ok(child) => child,
            Err(e) if io_error_is_process_creation(&e) => {
                error!(platform = self.platform.name(), error = %e, "Process creation is not permitted");
                return Err(AppError::ProcessCreationForbidden(process_creation_diagnostic(&e)));
            }
            Err(e) => return Err(AppError::Io(e)),
        };

        match timeout(PROBE_TIMEOUT, child.wait()).await {
            Ok(Ok(_)) => {
                self.creation_verified.store(true, Ordering::Release);
                Ok(())
            }
            Ok(Err(e)) => Err(AppError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(AppError::ProcessCreationForbidden(format!(
                    "probe process did not exit within {:?}",
                    PROBE_TIMEOUT
                )))
            }
        }
    }

    async fn write_script(&self, key: &str, script: &RenderedScript) -> Result<PathBuf, AppError> {
        ensure_private_dir(&self.config.script_dir).await?;
        let path = self
            .config
            .script_dir
            .join(format!("{}-{}.sh", sanitize_for_file_name(key), Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&path).await?;
        file.write_all(script.text.as_bytes()).await?;
        file.flush().await?;
        Ok(path)
    }

    /// Renders, writes and launches the supervisor for `segments`.
    #[instrument(skip(self, segments), fields(segments = segments.len()))]
    pub async fn launch(
        &self,
        key: &str,
        segments: Vec<CommandSegment>,
        mode: ExecutionMode,
    ) -> Result<SessionGroup, AppError> {
        let script = self.script_builder(mode)?.render(key, &segments)?;

        let candidates = self.available_interpreters();
        let Some((_, first)) = candidates.first() else {
            return Err(AppError::InterpreterNotFound(self.config.interpreters.clone()));
        };
        self.verify_process_creation(first).await?;

        let script_path = self.write_script(key, &script).await?;
        let mut tried = Vec::new();

        for (name, path) in &candidates {
            let mut cmd = TokioCommand::new(path);
            cmd.arg(&script_path);
            match mode {
                ExecutionMode::Foreground => {
                    cmd.stdin(StdProcessStdio::inherit())
                        .stdout(StdProcessStdio::inherit())
                        .stderr(StdProcessStdio::inherit());
                }
                ExecutionMode::Background => {
                    cmd.stdin(StdProcessStdio::null())
                        .stdout(StdProcessStdio::null())
                        .stderr(StdProcessStdio::null());
                }
            }
            if let Err(e) = self.platform.setup_supervisor(Some(&mut cmd)) {
                remove_script(&script_path).await;
                return Err(e);
            }

            match cmd.spawn() {
                Ok(child) => {
                    let session = SessionGroup::new(key, child, segments, mode, name.clone(), Some(script_path))?;
                    info!(
                        pid = session.session_id(),
                        pgid = session.process_group_id(),
                        interpreter = %name,
                        "Supervisor launched"
                    );
                    return Ok(session);
                }
                Err(e) if io_error_is_process_creation(&e) => {
                    remove_script(&script_path).await;
                    error!(interpreter = %name, error = %e, "Supervisor could not be created");
                    return Err(AppError::ProcessCreationForbidden(process_creation_diagnostic(&e)));
                }
                Err(e) => {
                    warn!(interpreter = %name, error = %e, "Interpreter failed to start; trying next");
                    tried.push(format!("{} ({})", name, e));
                }
            }
        }

        remove_script(&script_path).await;
        Err(AppError::InterpreterNotFound(tried))
    }
}

pub async fn remove_script(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove supervisor script");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::platform;
    use crate::engine::segmenter::segment_commands;

    fn builder(mode: ExecutionMode) -> ScriptBuilder {
        ScriptBuilder::new(mode, PathBuf::from("/opt/hopsmith"), Duration::from_secs(30), Duration::from_millis(200))
    }

    fn segments(list: &[&str]) -> Vec<CommandSegment> {
        segment_commands(&list.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn background_script_traps_and_waits() {
        let script = builder(ExecutionMode::Background)
            .render("a.b", &segments(&["echo start", "cd /tmp", "ssh u@h", "pw", "ls"]))
            .unwrap();
        let text = &script.text;

        assert!(text.contains("set -e\n"));
        assert!(text.contains("trap '__hs_stop_group; exit 143' TERM"));
        assert!(text.contains("kill -TERM -$$"));
        // script exit reaches the whole group, not only the recorded jobs
        let reap = &text[text.find("__hs_reap_jobs() {").unwrap()..text.find("trap '__hs_stop_group; exit 130' INT").unwrap()];
        assert!(reap.contains("trap '' INT TERM\n"));
        assert!(reap.contains("kill -TERM -$$ 2>/dev/null || true\n"));
        assert!(text.contains("trap '__hs_reap_jobs' EXIT\n"));
        assert!(text.contains("( echo start && cd /tmp ) &\nHS_SEGMENT_1_PID=$!"));
        assert!(text.contains(
            "'/opt/hopsmith' ssh-exec --timeout-secs 30 --settle-ms 200 -- 'ssh u@h' 'ls' &\nHS_SEGMENT_2_PID=$!"
        ));
        assert!(text.contains("HOPSMITH_SSH_SECRETS='{\"password\":\"pw\",\"nested\":[null]}'"));
        assert!(text.trim_end().ends_with("wait \"$HS_SEGMENT_1_PID\"\nwait \"$HS_SEGMENT_2_PID\"\nwait"));
    }

    #[test]
    fn foreground_script_runs_in_sequence() {
        let script = builder(ExecutionMode::Foreground)
            .render("a.b", &segments(&["echo one", "ssh u@h", "ls"]))
            .unwrap();
        assert!(!script.text.contains("trap"));
        assert!(!script.text.contains(" &\n"));
        assert!(!script.text.contains("wait"));
        assert!(!script.text.contains(SECRETS_ENV));
        assert!(script.text.contains("( echo one )\n"));
    }

    #[test]
    fn masking_hides_passwords() {
        let script = builder(ExecutionMode::Background)
            .render("k", &segments(&["ssh u@h", "s3cr3t", "uptime"]))
            .unwrap();
        assert!(script.text.contains("s3cr3t"));
        assert!(!script.masked().contains("s3cr3t"));
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert!(matches!(builder(ExecutionMode::Background).render("k", &[]), Err(AppError::EmptyCommandList(_))));
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn secrets_rebuild_the_hop() {
        let hop = SshHop::from_commands(&["ssh a".into(), "p1".into(), "ssh b".into(), "p2".into(), "ls".into()]).unwrap();
        let secrets = HopSecrets::from_hop(&hop);
        let json = serde_json::to_string(&secrets).unwrap();
        let parsed: HopSecrets = serde_json::from_str(&json).unwrap();
        let rebuilt = parsed.into_hop("ssh a".into(), vec!["ssh b".into(), "ls".into()]);
        assert_eq!(rebuilt, hop);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launches_a_background_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.script_dir = dir.path().join("scripts");
        config.interpreters = vec!["definitely-not-a-shell".into(), "sh".into()];
        let supervisor = SupervisorBuilder::new(Arc::new(config), platform::native());

        let session = supervisor
            .launch("t.launch", segments(&["true"]), ExecutionMode::Background)
            .await
            .unwrap();
        assert_eq!(session.interpreter(), "sh");
        assert_eq!(session.session_id(), session.process_group_id());

        let script = session.script_path().unwrap().to_path_buf();
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&script).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let mut leader = session.take_leader().unwrap();
        assert!(leader.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_interpreters_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.script_dir = dir.path().to_path_buf();
        config.interpreters = vec!["no-such-shell-a".into(), "no-such-shell-b".into()];
        let supervisor = SupervisorBuilder::new(Arc::new(config), platform::native());

        let err = supervisor
            .launch("t.none", segments(&["true"]), ExecutionMode::Background)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InterpreterNotFound(ref tried) if tried.len() == 2));
        assert!(!err.is_process_creation_failure());
    }
}
