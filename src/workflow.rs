//! Workflow files: TOML tables addressed by dotted keys.
//!
//! ```toml
//! [shop.prod.api]
//! commands = ["ssh deploy@bastion", "hunter2", "ssh deploy@api", "cd /srv/api", "tail -f log"]
//! mode = "foreground"
//!
//! [shop.prod.worker]
//! commands = ["echo starting"]
//! keep_alive = "./worker --port 9000"
//! ```

use crate::engine::session::ExecutionMode;
use crate::error::AppError;
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::debug;

/// A resolved target: what to run and how.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub key: String,
    pub commands: Vec<String>,
    pub mode: ExecutionMode,
    pub keep_alive: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowFile {
    path: PathBuf,
    root: Table,
}

impl WorkflowFile {
    pub async fn load(path: &Path) -> Result<Self, AppError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Workflow(format!("Cannot read workflow file {}: {}", path.display(), e))
        })?;
        let workflow = Self::parse(&text, path)?;
        debug!(path = %path.display(), targets = workflow.target_keys().len(), "Workflow file loaded");
        Ok(workflow)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, AppError> {
        let root = text.parse::<Table>()?;
        Ok(Self {
            path: path.to_path_buf(),
            root,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolve_target(&self, key: &str) -> Result<Target, AppError> {
        let mut table = &self.root;
        for part in key.split('.') {
            table = match table.get(part) {
                Some(Value::Table(child)) => child,
                _ => return Err(AppError::TargetNotFound(key.to_string())),
            };
        }

        let commands = match table.get("commands") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    other => Err(AppError::Workflow(format!(
                        "Target '{}': commands must be strings, found {}",
                        key,
                        other.type_str()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(AppError::Workflow(format!(
                    "Target '{}': commands must be an array, found {}",
                    key,
                    other.type_str()
                )))
            }
            None => return Err(AppError::Workflow(format!("Target '{}' has no commands", key))),
        };

        let mode = match table.get("mode") {
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(AppError::Workflow(format!(
                    "Target '{}': mode must be a string, found {}",
                    key,
                    other.type_str()
                )))
            }
            None => ExecutionMode::default(),
        };

        let keep_alive = match table.get("keep_alive") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            Some(Value::String(_)) | None => None,
            Some(other) => {
                return Err(AppError::Workflow(format!(
                    "Target '{}': keep_alive must be a string, found {}",
                    key,
                    other.type_str()
                )))
            }
        };

        Ok(Target {
            key: key.to_string(),
            commands,
            mode,
            keep_alive,
        })
    }

    /// Every dotted key whose table defines `commands`, sorted.
    pub fn target_keys(&self) -> Vec<String> {
        fn walk(table: &Table, prefix: &str, out: &mut Vec<String>) {
            for (name, value) in table {
                let Value::Table(child) = value else { continue };
                let key = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{}.{}", prefix, name)
                };
                if child.contains_key("commands") {
                    out.push(key.clone());
                }
                walk(child, &key, out);
            }
        }

        let mut keys = Vec::new();
        walk(&self.root, "", &mut keys);
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[shop.prod.api]
commands = ["ssh deploy@bastion", "hunter2", "ssh deploy@api", "cd /srv/api", "ls"]
mode = "foreground"

[shop.prod.worker]
commands = ["echo starting"]
keep_alive = "./worker --port 9000"

[shop.staging]
commands = ["echo staging"]

[shop.staging.db]
commands = ["psql -c 'select 1'"]

[broken]
commands = "ls"

[mixed]
commands = ["ls", 3]
"#;

    fn sample() -> WorkflowFile {
        WorkflowFile::parse(SAMPLE, Path::new("hopsmith.toml")).unwrap()
    }

    #[test]
    fn resolves_nested_targets() {
        let target = sample().resolve_target("shop.prod.api").unwrap();
        assert_eq!(target.commands.len(), 5);
        assert_eq!(target.commands[0], "ssh deploy@bastion");
        assert_eq!(target.mode, ExecutionMode::Foreground);
        assert_eq!(target.keep_alive, None);

        let worker = sample().resolve_target("shop.prod.worker").unwrap();
        assert_eq!(worker.mode, ExecutionMode::Background);
        assert_eq!(worker.keep_alive.as_deref(), Some("./worker --port 9000"));
    }

    #[test]
    fn lists_every_target_including_parents_with_commands() {
        assert_eq!(
            sample().target_keys(),
            vec!["broken", "mixed", "shop.prod.api", "shop.prod.worker", "shop.staging", "shop.staging.db"]
        );
    }

    #[test]
    fn missing_and_malformed_targets() {
        let workflow = sample();
        assert!(matches!(workflow.resolve_target("shop.dev"), Err(AppError::TargetNotFound(_))));
        assert!(matches!(workflow.resolve_target("shop.prod"), Err(AppError::Workflow(_))));
        assert!(matches!(workflow.resolve_target("broken"), Err(AppError::Workflow(_))));
        assert!(matches!(workflow.resolve_target("mixed"), Err(AppError::Workflow(_))));
        assert!(matches!(
            workflow.resolve_target("shop.prod.api.commands"),
            Err(AppError::TargetNotFound(_))
        ));
    }

    #[test]
    fn invalid_toml_is_a_workflow_error() {
        let err = WorkflowFile::parse("[unterminated", Path::new("x.toml")).unwrap_err();
        assert!(matches!(err, AppError::Workflow(_)));
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hopsmith.toml");
        tokio::fs::write(&path, SAMPLE).await.unwrap();
        let workflow = WorkflowFile::load(&path).await.unwrap();
        assert_eq!(workflow.path(), path.as_path());
        assert!(workflow.resolve_target("shop.staging.db").is_ok());

        let missing = WorkflowFile::load(&dir.path().join("nope.toml")).await.unwrap_err();
        assert!(matches!(missing, AppError::Workflow(_)));
    }
}
