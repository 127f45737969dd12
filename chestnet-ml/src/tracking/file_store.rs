//! Local tracking store: a JSON index plus an artifact directory tree.
//!
//! Layout under the store root:
//! - `tracking.json` — experiments, runs, metrics, params, tags, model versions
//! - `artifacts/<run_id>/<artifact_path>` — uploaded artifact files

use super::memory::{StoreState, StoredRun};
use super::{
    LogBatch, ModelVersion, RunInfo, RunStatus, RunTag, TrackingBackend, validate_artifact_path,
};
use crate::error::MlError;
use crate::persistence::{atomic_write, atomic_write_json, load_json};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const INDEX_FILE: &str = "tracking.json";
const ARTIFACT_DIR: &str = "artifacts";

pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on the index.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn artifact_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(ARTIFACT_DIR).join(run_id)
    }

    async fn load(&self) -> Result<StoreState, MlError> {
        Ok(load_json(&self.index_path()).await?.unwrap_or_default())
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> Result<T, MlError>) -> Result<T, MlError> {
        let _guard = self.lock.lock().await;
        let state = self.load().await?;
        f(&state)
    }

    async fn update<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> Result<T, MlError>,
    ) -> Result<T, MlError> {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await?;
        let out = f(&mut state)?;
        atomic_write_json(&self.index_path(), &state).await?;
        Ok(out)
    }

    /// Snapshot of a run and everything logged into it.
    pub async fn run(&self, run_id: &str) -> Result<StoredRun, MlError> {
        self.read(|state| state.run(run_id).cloned()).await
    }
}

/// Store errors surface as tracking-backend errors so callers see one failure kind.
fn backend_io(err: MlError) -> MlError {
    match err {
        MlError::Io(e) => MlError::tracking(format!("file store I/O: {e}")),
        MlError::Serde(e) => MlError::tracking(format!("file store index is corrupt: {e}")),
        other => other,
    }
}

#[async_trait]
impl TrackingBackend for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_or_create_experiment(&self, name: &str) -> Result<String, MlError> {
        self.update(|state| Ok(state.get_or_create_experiment(name)))
            .await
            .map_err(backend_io)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        let artifact_root = self.root.join(ARTIFACT_DIR);
        self.update(|state| {
            state.create_run(experiment_id, run_name, tags, |run_id| {
                artifact_root.join(run_id).display().to_string()
            })
        })
        .await
        .map_err(backend_io)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, MlError> {
        self.read(|state| Ok(state.run(run_id)?.info.clone()))
            .await
            .map_err(backend_io)
    }

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<RunInfo, MlError> {
        self.update(|state| state.update_run(run_id, status))
            .await
            .map_err(backend_io)
    }

    async fn log_batch(&self, run_id: &str, batch: &LogBatch) -> Result<(), MlError> {
        self.update(|state| state.log_batch(run_id, batch))
            .await
            .map_err(backend_io)
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: &[u8],
    ) -> Result<(), MlError> {
        let relative = validate_artifact_path(artifact_path)?;
        self.get_run(run_id).await?;
        atomic_write(&self.artifact_dir(run_id).join(relative), contents)
            .await
            .map_err(backend_io)
    }

    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion, MlError> {
        self.update(|state| state.register_model(name, run_id, source))
            .await
            .map_err(backend_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::Metric;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let run_id = {
            let store = FileStore::new(dir.path().to_path_buf());
            let exp = store.get_or_create_experiment("xray").await.unwrap();
            let tags = [RunTag {
                key: "dataset".into(),
                value: "ChestMNIST".into(),
            }];
            let run = store.create_run(&exp, "baseline", &tags).await.unwrap();
            store
                .log_batch(
                    &run.run_id,
                    &LogBatch::metrics(vec![Metric::new("test_auc_roc", 0.71, 0)]),
                )
                .await
                .unwrap();
            run.run_id
        };

        let reopened = FileStore::new(dir.path().to_path_buf());
        let run = reopened.run(&run_id).await.unwrap();
        assert_eq!(run.latest_metric("test_auc_roc"), Some(0.71));
        assert_eq!(run.tags["dataset"], "ChestMNIST");
        assert_eq!(run.info.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_artifacts_land_under_run_dir() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        let exp = store.get_or_create_experiment("xray").await.unwrap();
        let run = store.create_run(&exp, "r", &[]).await.unwrap();

        store
            .log_artifact(&run.run_id, "model/weights.json", b"{}")
            .await
            .unwrap();
        let written = dir
            .path()
            .join("artifacts")
            .join(&run.run_id)
            .join("model/weights.json");
        assert_eq!(std::fs::read(written).unwrap(), b"{}");

        let err = store
            .log_artifact(&run.run_id, "../outside", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, MlError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_missing_run_is_backend_error() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        let err = store.log_artifact("nope", "a.txt", b"x").await.unwrap_err();
        assert!(err.is_tracking());
    }
}
