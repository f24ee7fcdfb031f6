use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::utils::path_utils::expand_tilde_path_buf;

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub log_level: String,
    /// Interpreters tried in order when launching a supervisor script.
    pub interpreters: Vec<String>,
    pub script_dir: PathBuf,
    pub shutdown_timeout: Duration,
    pub ssh_timeout: Duration,
    pub prompt_settle: Duration,
    pub keep_alive_max_restarts: u32,
    pub allow_unsupervised_fallback: bool,
    pub workflow_file: PathBuf,
    /// Binary invoked by generated scripts for `ssh-exec`. `None` means the running executable.
    pub helper_bin: Option<PathBuf>,
    pub audit_log_file: PathBuf,
    pub audit_log_max_size_bytes: u64,
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T, name: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: '{}' ({})", name, v, e)),
        _ => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, default: bool, name: &str) -> Result<bool> {
    match raw.as_deref().map(|s| s.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("Invalid {}: '{}'", name, v),
        },
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_level = lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let interpreters: Vec<String> = lookup("HOPSMITH_SHELLS")
            .unwrap_or_else(|| "bash,sh,zsh".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if interpreters.is_empty() {
            anyhow::bail!("HOPSMITH_SHELLS must name at least one interpreter");
        }

        let script_dir = match lookup("HOPSMITH_SCRIPT_DIR").filter(|s| !s.is_empty()) {
            Some(dir) => expand_tilde_path_buf(&dir).context("Invalid HOPSMITH_SCRIPT_DIR")?,
            None => std::env::temp_dir().join("hopsmith"),
        };

        let shutdown_timeout = Duration::from_millis(parse_or(
            lookup("HOPSMITH_SHUTDOWN_TIMEOUT_MS"),
            10_000u64,
            "HOPSMITH_SHUTDOWN_TIMEOUT_MS",
        )?);
        let ssh_timeout = Duration::from_secs(parse_or(
            lookup("HOPSMITH_SSH_TIMEOUT_SECS"),
            30u64,
            "HOPSMITH_SSH_TIMEOUT_SECS",
        )?);
        let prompt_settle = Duration::from_millis(parse_or(
            lookup("HOPSMITH_PROMPT_SETTLE_MS"),
            200u64,
            "HOPSMITH_PROMPT_SETTLE_MS",
        )?);
        let keep_alive_max_restarts = parse_or(
            lookup("HOPSMITH_KEEPALIVE_MAX_RESTARTS"),
            5u32,
            "HOPSMITH_KEEPALIVE_MAX_RESTARTS",
        )?;
        let allow_unsupervised_fallback =
            parse_bool(lookup("HOPSMITH_ALLOW_FALLBACK"), true, "HOPSMITH_ALLOW_FALLBACK")?;

        let workflow_file = match lookup("HOPSMITH_WORKFLOW_FILE").filter(|s| !s.is_empty()) {
            Some(path) => expand_tilde_path_buf(&path).context("Invalid HOPSMITH_WORKFLOW_FILE")?,
            None => PathBuf::from("hopsmith.toml"),
        };

        let helper_bin = match lookup("HOPSMITH_HELPER_BIN").filter(|s| !s.is_empty()) {
            Some(path) => Some(expand_tilde_path_buf(&path).context("Invalid HOPSMITH_HELPER_BIN")?),
            None => None,
        };

        let log_dir_base = lookup("HOPSMITH_LOG_DIR")
            .filter(|s| !s.is_empty())
            .and_then(|s| match expand_tilde_path_buf(&s) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(error = %e, "Ignoring unusable HOPSMITH_LOG_DIR");
                    None
                }
            })
            .unwrap_or_else(|| script_dir.join("logs"));
        let audit_log_file = log_dir_base.join("sessions.log");
        let audit_log_max_size_bytes = lookup("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        Ok(Config {
            log_level,
            interpreters,
            script_dir,
            shutdown_timeout,
            ssh_timeout,
            prompt_settle,
            keep_alive_max_restarts,
            allow_unsupervised_fallback,
            workflow_file,
            helper_bin,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }
}
