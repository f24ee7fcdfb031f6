use crate::error::AppError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Expands tilde (~) and `$VAR` references in a path string.
pub fn expand_tilde_path_buf(path_str: &str) -> Result<PathBuf, AppError> {
    shellexpand::full(path_str)
        .map(|cow_str| PathBuf::from(cow_str.as_ref()))
        .map_err(|e| AppError::Workflow(format!("Failed to expand path '{}': {}", path_str, e)))
}

/// Creates `dir` (and parents) if missing, readable only by the current user.
/// An existing directory keeps its permissions.
pub async fn ensure_private_dir(dir: &Path) -> Result<(), AppError> {
    if tokio::fs::try_exists(dir).await? {
        return Ok(());
    }
    debug!(path = %dir.display(), "Creating private directory");
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

/// Turns a session key into something safe to embed in a file name.
pub fn sanitize_for_file_name(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_keys() {
        assert_eq!(sanitize_for_file_name("shop.prod.api"), "shop.prod.api");
        assert_eq!(sanitize_for_file_name("a/b c"), "a_b_c");
        assert_eq!(sanitize_for_file_name(""), "session");
    }

    #[test]
    fn leaves_absolute_paths_alone() {
        assert_eq!(expand_tilde_path_buf("/tmp/x").unwrap(), PathBuf::from("/tmp/x"));
    }

    #[tokio::test]
    async fn creates_nested_private_dirs() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("a").join("b");
        ensure_private_dir(&nested).await.unwrap();
        assert!(nested.is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(std::fs::metadata(&nested).unwrap().permissions().mode() & 0o777, 0o700);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn existing_dirs_keep_their_mode() {
        use std::os::unix::fs::PermissionsExt;
        let root = tempfile::tempdir().unwrap();
        let shared = root.path().join("shared");
        std::fs::create_dir(&shared).unwrap();
        std::fs::set_permissions(&shared, std::fs::Permissions::from_mode(0o755)).unwrap();

        ensure_private_dir(&shared).await.unwrap();
        assert_eq!(std::fs::metadata(&shared).unwrap().permissions().mode() & 0o777, 0o755);
    }
}
