use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    Started,
    Exited,
    Stopped,
    FallbackStarted,
    KeepAliveStarted,
}

impl SessionEvent {
    fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::Started => "started",
            SessionEvent::Exited => "exited",
            SessionEvent::Stopped => "stopped",
            SessionEvent::FallbackStarted => "fallback_started",
            SessionEvent::KeepAliveStarted => "keep_alive_started",
        }
    }
}

#[derive(Debug, Serialize)]
struct AuditDetails<'a> {
    pid: Option<i32>,
    exit_code: Option<i32>,
    segments: Option<usize>,
    note: Option<&'a str>,
}

/// Append-only log of session lifecycle events, rotated by size.
#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        // Ensure log directory exists
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn record(
        &self,
        key: &str,
        event: SessionEvent,
        pid: Option<i32>,
        exit_code: Option<i32>,
        segments: Option<usize>,
        note: Option<&str>,
    ) {
        let details = AuditDetails { pid, exit_code, segments, note };
        if let Err(e) = self.try_record(key, event, &details).await {
            error!(key = %key, event = event.as_str(), error = %e, "Failed to write session audit log");
        }
    }

    async fn try_record(&self, key: &str, event: SessionEvent, details: &AuditDetails<'_>) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();
        let details_string = serde_json::to_string(details)?;
        let log_entry = format!("{} | {:<18} | {} | {}\n", timestamp, event.as_str(), key, details_string);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path, max_size_bytes: u64) -> Config {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.audit_log_file = dir.join("logs").join("sessions.log");
        config.audit_log_max_size_bytes = max_size_bytes;
        config
    }

    #[tokio::test]
    async fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 1024 * 1024);
        let logger = AuditLogger::new(&config);

        logger.record("shop.prod.api", SessionEvent::Started, Some(42), None, Some(3), None).await;
        logger.record("shop.prod.api", SessionEvent::Exited, Some(42), Some(0), None, None).await;

        let content = std::fs::read_to_string(&config.audit_log_file).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("started"));
        assert!(lines[0].contains("shop.prod.api"));
        assert!(lines[0].contains("\"segments\":3"));
        assert!(lines[1].contains("\"exit_code\":0"));
    }

    #[tokio::test]
    async fn rotates_when_over_size() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path(), 10);
        let logger = AuditLogger::new(&config);

        logger.record("k", SessionEvent::Started, Some(1), None, None, None).await;
        logger.record("k", SessionEvent::Stopped, Some(1), None, None, Some("operator")).await;

        let entries = std::fs::read_dir(config.audit_log_file.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 2);
        let content = std::fs::read_to_string(&config.audit_log_file).unwrap();
        assert!(content.contains("stopped"));
        assert!(!content.contains("started"));
    }
}
