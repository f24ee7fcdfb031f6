use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hopsmith::config::Config;
use hopsmith::engine::session::ExecutionMode;
use hopsmith::engine::ssh_automaton::{run_ssh_hop, AutomatonOptions};
use hopsmith::engine::supervisor::{HopSecrets, SECRETS_ENV};
use hopsmith::engine::SequenceEngine;
use hopsmith::workflow::{Target, WorkflowFile};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[derive(Debug, Parser)]
#[command(name = "hopsmith", version, about = "Run local commands and password SSH hops as one supervised process group")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Launch a workflow target (or inline commands) and wait for it to end.
    Run {
        key: String,
        /// Hand this terminal to the workflow instead of detaching it.
        #[arg(long)]
        foreground: bool,
        #[arg(long, short)]
        file: Option<PathBuf>,
        /// Inline commands; skips the workflow file.
        #[arg(last = true)]
        commands: Vec<String>,
    },
    /// Print segments and the generated supervisor script without running anything.
    Plan {
        key: String,
        #[arg(long)]
        foreground: bool,
        #[arg(long, short)]
        file: Option<PathBuf>,
        #[arg(last = true)]
        commands: Vec<String>,
    },
    /// List targets defined in the workflow file.
    Targets {
        #[arg(long, short)]
        file: Option<PathBuf>,
    },
    /// Run one command, restarting it on failure, until Ctrl-C.
    KeepAlive {
        key: String,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Drive one SSH hop on a pseudo-terminal. Invoked by generated scripts.
    #[command(hide = true)]
    SshExec {
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
        #[arg(last = true, required = true)]
        argv: Vec<String>,
    },
}

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("hopsmith={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn resolve(config: &Config, key: &str, file: Option<PathBuf>, inline: Vec<String>) -> Result<Target> {
    if !inline.is_empty() {
        return Ok(Target {
            key: key.to_string(),
            commands: inline,
            mode: ExecutionMode::default(),
            keep_alive: None,
        });
    }
    let path = file.unwrap_or_else(|| config.workflow_file.clone());
    let workflow = WorkflowFile::load(&path).await?;
    Ok(workflow.resolve_target(key)?)
}

async fn run(engine: &SequenceEngine, target: Target, foreground: bool) -> Result<()> {
    let mode = if foreground { ExecutionMode::Foreground } else { target.mode };
    let key = target.key.as_str();

    if let Some(command) = &target.keep_alive {
        engine.start_keep_alive(&format!("{}.keep_alive", key), command).await?;
    }

    let outcome = match mode {
        ExecutionMode::Foreground => {
            tokio::select! {
                result = engine.run_sequence_with_mode(key, &target.commands, mode) => result.map_err(anyhow::Error::from),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted; stopping all sessions");
                    Ok(())
                }
            }
        }
        ExecutionMode::Background => {
            let session = engine.start_background(key, &target.commands).await?;
            tracing::info!(status = %serde_json::to_string(&engine.get_status())?, "Session started");
            match session {
                Some(session) => tokio::select! {
                    outcome = session.wait_complete() => {
                        tracing::info!(code = ?outcome.code, "Session finished");
                        outcome.into_result(key).map_err(anyhow::Error::from)
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Interrupted; stopping all sessions");
                        Ok(())
                    }
                },
                // unsupervised fallback: nothing registered to wait on
                None => Ok(()),
            }
        }
    };

    engine.stop_all().await?;
    outcome
}

async fn ssh_exec(timeout_secs: u64, settle_ms: u64, argv: Vec<String>) -> Result<()> {
    let secrets: HopSecrets = match std::env::var(SECRETS_ENV) {
        Ok(raw) => serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", SECRETS_ENV))?,
        Err(_) => HopSecrets::default(),
    };
    let (ssh_command, remote) = argv.split_first().context("ssh-exec needs an ssh command")?;
    let hop = secrets.into_hop(ssh_command.clone(), remote.to_vec());
    let options = AutomatonOptions {
        overall_timeout: Duration::from_secs(timeout_secs.max(1)),
        prompt_settle: Duration::from_millis(settle_ms),
        ..Default::default()
    };
    run_ssh_hop(&hop, options, Some(Box::new(std::io::stdout()))).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);
    tracing::debug!(?config, "Loaded configuration");

    match cli.command {
        Commands::SshExec { timeout_secs, settle_ms, argv } => ssh_exec(timeout_secs, settle_ms, argv).await,
        Commands::Targets { file } => {
            let path = file.unwrap_or_else(|| config.workflow_file.clone());
            let workflow = WorkflowFile::load(&path).await?;
            for key in workflow.target_keys() {
                println!("{}", key);
            }
            Ok(())
        }
        Commands::Plan { key, foreground, file, commands } => {
            let target = resolve(&config, &key, file, commands).await?;
            let mode = if foreground { ExecutionMode::Foreground } else { target.mode };
            let engine = SequenceEngine::new(Arc::new(config));
            let plan = engine.plan(&key, &target.commands, mode)?;
            for (index, segment) in plan.segments.iter().enumerate() {
                println!("segment {} ({:?}): {}", index + 1, segment.segment_type(), segment.commands().len());
            }
            println!("{}", plan.script);
            Ok(())
        }
        Commands::Run { key, foreground, file, commands } => {
            let target = resolve(&config, &key, file, commands).await?;
            let engine = SequenceEngine::new(Arc::new(config));
            tracing::info!(version = %env!("CARGO_PKG_VERSION"), key = %key, "Starting hopsmith");
            run(&engine, target, foreground).await
        }
        Commands::KeepAlive { key, command } => {
            let engine = SequenceEngine::new(Arc::new(config));
            engine.start_keep_alive(&key, &command.join(" ")).await?;
            tokio::select! {
                status = engine.wait_keep_alive(&key) => {
                    let status = status?;
                    tracing::info!(?status, "Keep-alive command finished");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted; stopping keep-alive command");
                }
            }
            engine.stop_all().await?;
            Ok(())
        }
    }
}
