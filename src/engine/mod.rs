//! Session engine: turns a command list into a supervised process group and
//! owns every live session and keep-alive command for its lifetime.

pub mod keepalive;
pub mod platform;
pub mod registry;
pub mod segmenter;
pub mod session;
pub mod signal_manager;
pub mod ssh_automaton;
pub mod status;
pub mod supervisor;

use crate::config::Config;
use crate::error::{AppError, SessionFailure};
use crate::utils::audit_logger::{AuditLogger, SessionEvent};
use keepalive::{BackoffPolicy, KeepAliveHandle, KeepAliveRunner, ProcessStatus};
use platform::{signal_process_group, GroupSignal, PlatformProcessManager};
use registry::SessionRegistry;
use segmenter::{segment_commands, CommandSegment, SegmentType};
use serde::Serialize;
use session::{ExecutionMode, ExitOutcome, SessionGroup};
use signal_manager::SignalManager;
use ssh_automaton::{run_ssh_hop, AutomatonOptions, SshHop};
use status::{ProcessInfo, ProcessSnapshotter};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::process::Stdio as StdProcessStdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use supervisor::{remove_script, SupervisorBuilder};
use tokio::process::Command as TokioCommand;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// What `run` would launch, without launching it.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub key: String,
    pub mode: ExecutionMode,
    pub segments: Vec<CommandSegment>,
    /// Generated supervisor script with passwords masked.
    pub script: String,
}

enum Started {
    Supervised(Arc<SessionGroup>, JoinHandle<ExitOutcome>),
    Unsupervised,
}

#[derive(Debug)]
pub struct SequenceEngine {
    config: Arc<Config>,
    platform: Arc<dyn PlatformProcessManager>,
    registry: Arc<SessionRegistry>,
    signals: SignalManager,
    supervisor: SupervisorBuilder,
    keep_alive: StdMutex<HashMap<String, KeepAliveHandle>>,
    snapshotter: ProcessSnapshotter,
    audit: Arc<AuditLogger>,
}

impl SequenceEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_platform(config, platform::native())
    }

    pub fn with_platform(config: Arc<Config>, platform: Arc<dyn PlatformProcessManager>) -> Self {
        info!(platform = platform.name(), "Initializing sequence engine");
        Self {
            supervisor: SupervisorBuilder::new(config.clone(), platform.clone()),
            audit: Arc::new(AuditLogger::new(&config)),
            config,
            platform,
            registry: Arc::new(SessionRegistry::new()),
            signals: SignalManager::new(),
            keep_alive: StdMutex::new(HashMap::new()),
            snapshotter: ProcessSnapshotter::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn signals(&self) -> &SignalManager {
        &self.signals
    }

    fn validate(&self, key: &str, commands: &[String]) -> Result<(), AppError> {
        if commands.is_empty() {
            return Err(AppError::EmptyCommandList(key.to_string()));
        }
        if self.registry.contains(key) || self.keep_alive_map().contains_key(key) {
            return Err(AppError::DuplicateSession(key.to_string()));
        }
        Ok(())
    }

    fn keep_alive_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeepAliveHandle>> {
        self.keep_alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn automaton_options(&self) -> AutomatonOptions {
        AutomatonOptions {
            overall_timeout: self.config.ssh_timeout,
            prompt_settle: self.config.prompt_settle,
            ..Default::default()
        }
    }

    pub fn plan(&self, key: &str, commands: &[String], mode: ExecutionMode) -> Result<Plan, AppError> {
        if commands.is_empty() {
            return Err(AppError::EmptyCommandList(key.to_string()));
        }
        let segments = segment_commands(commands)?;
        let script = self.supervisor.script_builder(mode)?.render(key, &segments)?;
        Ok(Plan {
            key: key.to_string(),
            mode,
            segments,
            script: script.masked(),
        })
    }

    pub async fn run_sequence(&self, key: &str, commands: &[String]) -> Result<(), AppError> {
        self.run_sequence_with_mode(key, commands, ExecutionMode::Background).await
    }

    /// Launches `commands` as one supervised session under `key`.
    ///
    /// Background returns once the session is registered; Foreground blocks
    /// until it exits and fails on a non-zero status.
    #[instrument(skip(self, commands), fields(commands = commands.len()))]
    pub async fn run_sequence_with_mode(
        &self,
        key: &str,
        commands: &[String],
        mode: ExecutionMode,
    ) -> Result<(), AppError> {
        match (self.start(key, commands, mode).await?, mode) {
            (Started::Supervised(_, monitor), ExecutionMode::Foreground) => monitor
                .await
                .map_err(|e| AppError::TaskFailed(key.to_string(), e.to_string()))?
                .into_result(key),
            _ => Ok(()),
        }
    }

    /// Background launch that hands back the session itself, so the caller can
    /// wait on it even after the monitor has dropped it from the registry.
    /// `None` means the commands went to the unsupervised fallback.
    pub async fn start_background(
        &self,
        key: &str,
        commands: &[String],
    ) -> Result<Option<Arc<SessionGroup>>, AppError> {
        match self.start(key, commands, ExecutionMode::Background).await? {
            Started::Supervised(session, _) => Ok(Some(session)),
            Started::Unsupervised => Ok(None),
        }
    }

    async fn start(&self, key: &str, commands: &[String], mode: ExecutionMode) -> Result<Started, AppError> {
        self.validate(key, commands)?;
        let segments = segment_commands(commands)?;
        debug!(segments = segments.len(), "Commands segmented");

        let session = match self.supervisor.launch(key, segments.clone(), mode).await {
            Ok(session) => Arc::new(session),
            Err(e) if e.is_process_creation_failure() && self.config.allow_unsupervised_fallback => {
                warn!(error = %e, "Supervisor unavailable; running commands without supervision");
                self.run_unsupervised(key, segments, mode).await?;
                return Ok(Started::Unsupervised);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.registry.register(key, session.clone()) {
            // Lost a race with another start for the same key.
            abandon(&session).await;
            return Err(e);
        }
        self.audit
            .record(
                key,
                SessionEvent::Started,
                Some(session.session_id()),
                None,
                Some(session.segments().len()),
                Some(session.interpreter()),
            )
            .await;

        let monitor = self.spawn_monitor(session.clone());
        Ok(Started::Supervised(session, monitor))
    }

    /// One task per session: waits on the leader, then cleans up after it.
    fn spawn_monitor(&self, session: Arc<SessionGroup>) -> JoinHandle<ExitOutcome> {
        let signals = self.signals.clone();
        let registry = self.registry.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            let key = session.key().to_string();
            let outcome = match signals.manage(session.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(key = %key, error = %e, "Session monitor failed");
                    let outcome = ExitOutcome { code: None };
                    session.mark_complete(outcome);
                    outcome
                }
            };
            registry.unregister_if_same(&key, &session);
            if let Some(path) = session.script_path() {
                remove_script(path).await;
            }
            audit
                .record(&key, SessionEvent::Exited, Some(session.session_id()), outcome.code, None, None)
                .await;
            outcome
        })
    }

    /// Runs segments one after another with no process group or registry entry.
    async fn run_unsupervised(
        &self,
        key: &str,
        segments: Vec<CommandSegment>,
        mode: ExecutionMode,
    ) -> Result<(), AppError> {
        let interpreter = self
            .supervisor
            .available_interpreters()
            .into_iter()
            .next()
            .map(|(_, path)| path)
            .ok_or_else(|| AppError::InterpreterNotFound(self.config.interpreters.clone()))?;
        self.audit
            .record(key, SessionEvent::FallbackStarted, None, None, Some(segments.len()), None)
            .await;

        let key = key.to_string();
        let options = self.automaton_options();
        let run = async move {
            for segment in &segments {
                match segment.segment_type() {
                    SegmentType::Local => {
                        let status = TokioCommand::new(&interpreter)
                            .arg("-c")
                            .arg(segment.commands().join(" && "))
                            .stdin(StdProcessStdio::null())
                            .status()
                            .await?;
                        if !status.success() {
                            return Err(AppError::SequenceFailed {
                                key: key.clone(),
                                code: status.code(),
                            });
                        }
                    }
                    SegmentType::RemoteSsh => {
                        let hop = SshHop::from_segment(segment)?;
                        run_ssh_hop(&hop, options.clone(), Some(Box::new(std::io::stdout()))).await?;
                    }
                }
            }
            info!(key = %key, "Unsupervised run finished");
            Ok(())
        };

        match mode {
            ExecutionMode::Foreground => run.await,
            ExecutionMode::Background => {
                tokio::spawn(async move {
                    if let Err(e) = run.await {
                        error!(error = %e, "Unsupervised background run failed");
                    }
                });
                Ok(())
            }
        }
    }

    /// Waits for the session under `key` to exit.
    pub async fn wait(&self, key: &str) -> Result<ExitOutcome, AppError> {
        let session = self
            .registry
            .get(key)
            .ok_or_else(|| AppError::SessionNotFound(key.to_string()))?;
        Ok(session.wait_complete().await)
    }

    /// Graceful-then-forced stop of whatever runs under `key`. Absent keys are a no-op.
    #[instrument(skip(self))]
    pub async fn stop_by_key(&self, key: &str) -> Result<(), AppError> {
        let keep_alive = self.keep_alive_map().remove(key);
        if let Some(handle) = keep_alive {
            let status = handle.stop().await?;
            info!(?status, "Keep-alive command stopped");
            self.audit.record(key, SessionEvent::Stopped, None, None, None, Some("keep-alive")).await;
            return Ok(());
        }

        let Some(session) = self.registry.get(key) else {
            debug!("No session under this key; nothing to stop");
            return Ok(());
        };
        let result = self
            .signals
            .graceful_shutdown(&session, self.config.shutdown_timeout)
            .await;
        self.registry.unregister_if_same(key, &session);
        self.audit
            .record(key, SessionEvent::Stopped, Some(session.session_id()), session.outcome().and_then(|o| o.code), None, None)
            .await;
        result
    }

    /// Stops every session and keep-alive command concurrently, reporting all failures.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Result<(), AppError> {
        let handles: Vec<(String, KeepAliveHandle)> = self.keep_alive_map().drain().collect();
        let sessions = self.registry.all();
        let (mut failures, result) = tokio::join!(
            stop_keep_alives(handles),
            self.signals
                .shutdown_all_sessions(&self.registry, self.config.shutdown_timeout),
        );
        for session in &sessions {
            self.registry.unregister_if_same(session.key(), session);
        }

        match result {
            Ok(()) => {}
            Err(AppError::AggregateShutdown(session_failures)) => failures.extend(session_failures),
            Err(e) => return Err(e),
        }
        if failures.is_empty() {
            info!(sessions = sessions.len(), "All sessions stopped");
            Ok(())
        } else {
            failures.sort_by(|a, b| a.key.cmp(&b.key));
            Err(AppError::AggregateShutdown(failures))
        }
    }

    /// Starts `command` under `key`, restarting it on failure.
    #[instrument(skip(self))]
    pub async fn start_keep_alive(&self, key: &str, command: &str) -> Result<(), AppError> {
        if command.trim().is_empty() {
            return Err(AppError::EmptyCommandList(key.to_string()));
        }
        let (name, _) = self
            .supervisor
            .available_interpreters()
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InterpreterNotFound(self.config.interpreters.clone()))?;
        let policy = BackoffPolicy::default().with_max_restarts(self.config.keep_alive_max_restarts);

        {
            let mut map = self.keep_alive_map();
            if map.contains_key(key) || self.registry.contains(key) {
                return Err(AppError::DuplicateSession(key.to_string()));
            }
            let runner = KeepAliveRunner::new(key, command, name, self.platform.clone(), policy);
            map.insert(key.to_string(), KeepAliveHandle::spawn(runner));
        }
        self.audit
            .record(key, SessionEvent::KeepAliveStarted, None, None, None, Some(command))
            .await;
        Ok(())
    }

    /// Blocks until the keep-alive command under `key` reaches a final status.
    pub async fn wait_keep_alive(&self, key: &str) -> Result<ProcessStatus, AppError> {
        let mut finished = self
            .keep_alive_map()
            .get(key)
            .map(KeepAliveHandle::finished)
            .ok_or_else(|| AppError::SessionNotFound(key.to_string()))?;
        // a dropped sender means the runner task is gone too
        let _ = finished.wait_for(|done| *done).await;

        let handle = {
            let mut map = self.keep_alive_map();
            match map.get(key) {
                Some(handle) if handle.is_finished() => map.remove(key),
                _ => None,
            }
        };
        match handle {
            Some(handle) => handle.join().await,
            // stopped through another path while we waited
            None => Err(AppError::SessionNotFound(key.to_string())),
        }
    }

    /// Point-in-time view of every session's process tree and keep-alive command.
    pub fn get_status(&self) -> BTreeMap<String, Vec<ProcessInfo>> {
        let mut status = BTreeMap::new();
        for session in self.registry.all() {
            let mut processes = vec![ProcessInfo::for_leader(&session)];
            if let Ok(pid) = u32::try_from(session.session_id()) {
                processes.extend(self.snapshotter.descendants(pid));
            }
            status.insert(session.key().to_string(), processes);
        }
        for (key, handle) in self.keep_alive_map().iter() {
            status
                .entry(key.clone())
                .or_insert_with(Vec::new)
                .push(ProcessInfo::for_keep_alive(&handle.snapshot()));
        }
        status
    }
}

/// Stops keep-alive commands side by side; each may take a full terminate grace.
async fn stop_keep_alives(handles: Vec<(String, KeepAliveHandle)>) -> Vec<SessionFailure> {
    let mut pending: BTreeSet<String> = handles.iter().map(|(key, _)| key.clone()).collect();
    let mut failures = Vec::new();
    let mut tasks = JoinSet::new();
    for (key, handle) in handles {
        tasks.spawn(async move { (key, handle.stop().await) });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((key, result)) => {
                pending.remove(&key);
                if let Err(e) = result {
                    failures.push(SessionFailure { key, reason: e.to_string() });
                }
            }
            Err(e) => warn!(error = %e, "Keep-alive stop task panicked"),
        }
    }
    failures.extend(pending.into_iter().map(|key| SessionFailure {
        key,
        reason: "keep-alive stop did not finish".to_string(),
    }));
    failures
}

/// Kills a session that was launched but never registered.
async fn abandon(session: &SessionGroup) {
    if let Err(e) = signal_process_group(session.process_group_id(), GroupSignal::Kill) {
        warn!(key = %session.key(), error = %e, "Failed to kill unregistered session");
    }
    if let Some(mut leader) = session.take_leader() {
        let _ = leader.wait().await;
    }
    if let Some(path) = session.script_path() {
        remove_script(path).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::status::ProcessRole;
    use std::time::Duration;

    fn engine_in(dir: &std::path::Path) -> SequenceEngine {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.interpreters = vec!["sh".to_string()];
        config.script_dir = dir.join("scripts");
        config.audit_log_file = dir.join("logs").join("sessions.log");
        config.shutdown_timeout = Duration::from_secs(2);
        SequenceEngine::new(Arc::new(config))
    }

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn rejects_empty_lists_and_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        let err = engine.run_sequence("empty", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::EmptyCommandList(ref k) if k == "empty"));

        engine.run_sequence("svc", &cmds(&["sleep 30"])).await.unwrap();
        let err = engine.run_sequence("svc", &cmds(&["sleep 1"])).await.unwrap_err();
        assert!(matches!(err, AppError::DuplicateSession(_)));

        engine.stop_by_key("svc").await.unwrap();
        assert_eq!(engine.registry().count(), 0);
    }

    #[tokio::test]
    async fn foreground_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine
            .run_sequence_with_mode("ok", &cmds(&["true", "true"]), ExecutionMode::Foreground)
            .await
            .unwrap();
        let err = engine
            .run_sequence_with_mode("bad", &cmds(&["false"]), ExecutionMode::Foreground)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::SequenceFailed { code: Some(_), .. }));
        assert_eq!(engine.registry().count(), 0);

        // scripts are removed once sessions end
        let leftovers = std::fs::read_dir(dir.path().join("scripts")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn background_session_is_cleaned_up_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine.run_sequence("short", &cmds(&["sleep 0.2"])).await.unwrap();
        assert!(engine.registry().contains("short"));
        let outcome = engine.wait("short").await.unwrap();
        assert_eq!(outcome.code, Some(0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!engine.registry().contains("short"));
    }

    #[tokio::test]
    async fn stop_of_unknown_key_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.stop_by_key("ghost").await.unwrap();
        engine.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn status_lists_leaders_and_keep_alive_commands() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine.run_sequence("web", &cmds(&["sleep 30"])).await.unwrap();
        engine.start_keep_alive("worker", "sleep 30").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = engine.get_status();
        let web = &status["web"];
        assert_eq!(web[0].role, ProcessRole::Leader);
        assert!(web.iter().skip(1).any(|p| p.command.contains("sleep")));
        let worker = &status["worker"];
        assert_eq!(worker[0].role, ProcessRole::KeepAlive);
        assert_eq!(worker[0].status, Some(ProcessStatus::Running));

        engine.stop_all().await.unwrap();
        assert!(engine.get_status().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_key_cannot_be_reused_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.start_keep_alive("k", "sleep 30").await.unwrap();
        assert!(matches!(engine.start_keep_alive("k", "sleep 1").await, Err(AppError::DuplicateSession(_))));
        assert!(matches!(engine.run_sequence("k", &cmds(&["ls"])).await, Err(AppError::DuplicateSession(_))));
        engine.stop_by_key("k").await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_keep_alive_to_complete() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.start_keep_alive("once", "exit 0").await.unwrap();
        assert_eq!(engine.wait_keep_alive("once").await.unwrap(), ProcessStatus::Completed);
        assert!(matches!(engine.wait_keep_alive("once").await, Err(AppError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn background_handle_outlives_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        let session = engine.start_background("quick", &cmds(&["exit 4"])).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!engine.registry().contains("quick"));

        let err = session.wait_complete().await.into_result("quick").unwrap_err();
        assert!(matches!(err, AppError::SequenceFailed { code: Some(4), .. }));
    }

    #[tokio::test]
    async fn keep_alive_commands_stop_side_by_side() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        for key in ["w1", "w2", "w3"] {
            engine
                .start_keep_alive(key, "trap '' TERM; while :; do sleep 0.1; done")
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = std::time::Instant::now();
        engine.stop_all().await.unwrap();
        // each one needs a full terminate grace before SIGKILL
        assert!(started.elapsed() < platform::TERMINATE_GRACE * 2);
        assert!(engine.get_status().is_empty());
    }

    #[tokio::test]
    async fn script_dir_errors_are_not_downgraded() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let marker = dir.path().join("ran");

        let mut config = Config::from_lookup(|_| None).unwrap();
        config.interpreters = vec!["sh".to_string()];
        config.script_dir = blocker.join("scripts");
        config.audit_log_file = dir.path().join("logs").join("sessions.log");
        config.allow_unsupervised_fallback = true;
        let engine = SequenceEngine::new(Arc::new(config));

        let err = engine
            .run_sequence_with_mode("cfg", &cmds(&[format!("touch {}", marker.display()).as_str()]), ExecutionMode::Foreground)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Io(_)), "unexpected error: {err}");
        assert!(!marker.exists());
    }

    mod fallback {
        use super::*;
        use tokio::process::Child;

        /// Behaves like a sandbox that refuses new sessions.
        #[derive(Debug)]
        struct SessionlessPlatform;

        #[async_trait::async_trait]
        impl PlatformProcessManager for SessionlessPlatform {
            fn setup(&self, _command: &mut TokioCommand) -> Result<(), AppError> {
                Ok(())
            }

            fn setup_supervisor(&self, _command: Option<&mut TokioCommand>) -> Result<(), AppError> {
                Err(AppError::ProcessCreationForbidden("setsid refused by sandbox".to_string()))
            }

            async fn terminate(&self, child: &mut Child) -> Result<(), AppError> {
                child.kill().await?;
                Ok(())
            }

            fn name(&self) -> &'static str {
                "sessionless"
            }
        }

        fn sandboxed_engine(dir: &std::path::Path, allow_fallback: bool) -> SequenceEngine {
            let mut config = Config::from_lookup(|_| None).unwrap();
            config.interpreters = vec!["sh".to_string()];
            config.script_dir = dir.join("scripts");
            config.audit_log_file = dir.join("logs").join("sessions.log");
            config.allow_unsupervised_fallback = allow_fallback;
            SequenceEngine::with_platform(Arc::new(config), Arc::new(SessionlessPlatform))
        }

        fn scripts_left(dir: &std::path::Path) -> usize {
            std::fs::read_dir(dir.join("scripts")).map(|d| d.count()).unwrap_or(0)
        }

        #[tokio::test]
        async fn foreground_runs_local_segments_directly() {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("out");
            std::fs::create_dir(&out).unwrap();
            let engine = sandboxed_engine(dir.path(), true);

            engine
                .run_sequence_with_mode(
                    "direct",
                    &cmds(&[format!("cd {}", out.display()).as_str(), "touch first", "touch second"]),
                    ExecutionMode::Foreground,
                )
                .await
                .unwrap();

            assert!(out.join("first").exists());
            assert!(out.join("second").exists());
            assert_eq!(engine.registry().count(), 0);
            assert_eq!(scripts_left(dir.path()), 0);
            let audit = std::fs::read_to_string(dir.path().join("logs").join("sessions.log")).unwrap();
            assert!(audit.contains("fallback_started"));
        }

        #[tokio::test]
        async fn foreground_failure_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let engine = sandboxed_engine(dir.path(), true);
            let err = engine
                .run_sequence_with_mode("direct", &cmds(&["exit 5"]), ExecutionMode::Foreground)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::SequenceFailed { code: Some(5), .. }));
        }

        #[tokio::test]
        async fn background_returns_before_commands_finish() {
            let dir = tempfile::tempdir().unwrap();
            let done = dir.path().join("done");
            let engine = sandboxed_engine(dir.path(), true);

            let session = engine
                .start_background("later", &cmds(&["sleep 0.2", format!("touch {}", done.display()).as_str()]))
                .await
                .unwrap();
            assert!(session.is_none());
            assert!(!engine.registry().contains("later"));

            let deadline = std::time::Instant::now() + Duration::from_secs(3);
            while !done.exists() && std::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(done.exists());
        }

        #[tokio::test]
        async fn disabled_fallback_surfaces_the_error() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("ran");
            let engine = sandboxed_engine(dir.path(), false);

            let err = engine
                .run_sequence_with_mode("strict", &cmds(&[format!("touch {}", marker.display()).as_str()]), ExecutionMode::Foreground)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::ProcessCreationForbidden(_)));
            assert!(!marker.exists());
            assert_eq!(scripts_left(dir.path()), 0);
        }
    }

    #[test]
    fn plan_masks_passwords() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let plan = engine
            .plan("jump", &cmds(&["ssh u@bastion", "s3cr3t!", "ls"]), ExecutionMode::Background)
            .unwrap();
        assert_eq!(plan.segments.len(), 1);
        assert!(!plan.script.contains("s3cr3t!"));
    }
}
