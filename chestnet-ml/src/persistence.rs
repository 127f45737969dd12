//! Atomic file writes and JSON load/save for the local tracking store.
//!
//! Writes go to a `.tmp` sibling first and are renamed into place, so a crash
//! mid-write never leaves a truncated index or artifact behind.

use crate::error::MlError;
use std::path::{Path, PathBuf};

/// Atomically write `data` as pretty-printed JSON.
pub async fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> Result<(), MlError> {
    let json = serde_json::to_vec_pretty(data)?;
    atomic_write(path, &json).await
}

/// Atomically write raw bytes, creating parent directories as needed.
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Load JSON from `path`; `Ok(None)` if the file does not exist.
pub async fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, MlError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RunIndex {
        run_id: String,
        steps: u32,
    }

    #[tokio::test]
    async fn test_atomic_write_json_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let data = RunIndex {
            run_id: "abc".into(),
            steps: 12,
        };

        atomic_write_json(&path, &data).await.unwrap();
        let loaded: Option<RunIndex> = load_json(&path).await.unwrap();
        assert_eq!(loaded, Some(data));
    }

    #[tokio::test]
    async fn test_atomic_write_creates_parent_dirs_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("artifacts").join("run").join("MLmodel");

        atomic_write(&path, b"flavors: {}").await.unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("artifacts/run/MLmodel.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_json_missing_file() {
        let loaded: Option<RunIndex> = load_json(Path::new("/nonexistent/index.json"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }
}
