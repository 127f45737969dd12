//! Process-local tracking store, plus the run bookkeeping shared with the file store.

use super::{
    LogBatch, Metric, ModelVersion, RunInfo, RunStatus, RunTag, TrackingBackend, now_millis,
    validate_artifact_path,
};
use crate::error::MlError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// A run together with everything logged into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub info: RunInfo,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl StoredRun {
    /// Most recent value logged under `key`.
    pub fn latest_metric(&self, key: &str) -> Option<f64> {
        self.metrics
            .iter()
            .filter(|m| m.key == key)
            .max_by_key(|m| (m.step, m.timestamp))
            .map(|m| m.value)
    }

    /// All values logged under `key`, in logging order.
    pub fn metric_history(&self, key: &str) -> Vec<&Metric> {
        self.metrics.iter().filter(|m| m.key == key).collect()
    }
}

/// Experiments, runs and model versions of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    /// Experiment name -> experiment id.
    #[serde(default)]
    pub experiments: BTreeMap<String, String>,
    #[serde(default)]
    pub runs: BTreeMap<String, StoredRun>,
    /// Registered model name -> versions, oldest first.
    #[serde(default)]
    pub models: BTreeMap<String, Vec<ModelVersion>>,
}

impl StoreState {
    pub(crate) fn get_or_create_experiment(&mut self, name: &str) -> String {
        let next_id = self.experiments.len().to_string();
        self.experiments
            .entry(name.to_string())
            .or_insert(next_id)
            .clone()
    }

    pub(crate) fn create_run(
        &mut self,
        experiment_id: &str,
        run_name: &str,
        tags: &[RunTag],
        artifact_root: impl FnOnce(&str) -> String,
    ) -> Result<RunInfo, MlError> {
        if !self.experiments.values().any(|id| id == experiment_id) {
            return Err(MlError::tracking(format!(
                "experiment {experiment_id} does not exist"
            )));
        }
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let info = RunInfo {
            run_id: run_id.clone(),
            experiment_id: experiment_id.to_string(),
            run_name: run_name.to_string(),
            status: RunStatus::Running,
            artifact_uri: artifact_root(&run_id),
            start_time: Some(now_millis()),
            end_time: None,
        };
        self.runs.insert(
            run_id,
            StoredRun {
                info: info.clone(),
                metrics: Vec::new(),
                params: BTreeMap::new(),
                tags: tags
                    .iter()
                    .map(|t| (t.key.clone(), t.value.clone()))
                    .collect(),
            },
        );
        Ok(info)
    }

    pub(crate) fn run(&self, run_id: &str) -> Result<&StoredRun, MlError> {
        self.runs
            .get(run_id)
            .ok_or_else(|| MlError::tracking(format!("run {run_id} does not exist")))
    }

    fn run_mut(&mut self, run_id: &str) -> Result<&mut StoredRun, MlError> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| MlError::tracking(format!("run {run_id} does not exist")))
    }

    pub(crate) fn update_run(&mut self, run_id: &str, status: RunStatus) -> Result<RunInfo, MlError> {
        let run = self.run_mut(run_id)?;
        run.info.status = status;
        run.info.end_time = status.is_terminal().then(now_millis);
        Ok(run.info.clone())
    }

    pub(crate) fn log_batch(&mut self, run_id: &str, batch: &LogBatch) -> Result<(), MlError> {
        let run = self.run_mut(run_id)?;
        // Params are write-once, as on an MLflow server.
        for param in &batch.params {
            if let Some(existing) = run.params.get(&param.key) {
                if existing != &param.value {
                    return Err(MlError::tracking(format!(
                        "param {} already logged with value {existing}, refusing {}",
                        param.key, param.value
                    )));
                }
            }
        }
        for param in &batch.params {
            run.params.insert(param.key.clone(), param.value.clone());
        }
        for tag in &batch.tags {
            run.tags.insert(tag.key.clone(), tag.value.clone());
        }
        run.metrics.extend(batch.metrics.iter().cloned());
        Ok(())
    }

    pub(crate) fn register_model(
        &mut self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion, MlError> {
        self.run(run_id)?;
        let versions = self.models.entry(name.to_string()).or_default();
        let version = ModelVersion {
            name: name.to_string(),
            version: (versions.len() + 1).to_string(),
            source: source.to_string(),
            run_id: run_id.to_string(),
        };
        versions.push(version.clone());
        Ok(version)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: StoreState,
    /// (run id, artifact path) -> contents.
    artifacts: BTreeMap<(String, String), Vec<u8>>,
}

/// Tracking store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    inner: Mutex<MemoryInner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a run and everything logged into it.
    pub async fn run(&self, run_id: &str) -> Option<StoredRun> {
        self.inner.lock().await.state.runs.get(run_id).cloned()
    }

    pub async fn runs(&self) -> Vec<StoredRun> {
        self.inner.lock().await.state.runs.values().cloned().collect()
    }

    pub async fn artifact(&self, run_id: &str, artifact_path: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .await
            .artifacts
            .get(&(run_id.to_string(), artifact_path.to_string()))
            .cloned()
    }

    pub async fn model_versions(&self, name: &str) -> Vec<ModelVersion> {
        self.inner
            .lock()
            .await
            .state
            .models
            .get(name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TrackingBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_or_create_experiment(&self, name: &str) -> Result<String, MlError> {
        Ok(self.inner.lock().await.state.get_or_create_experiment(name))
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        self.inner
            .lock()
            .await
            .state
            .create_run(experiment_id, run_name, tags, |run_id| {
                format!("memory:/{experiment_id}/{run_id}/artifacts")
            })
    }

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, MlError> {
        Ok(self.inner.lock().await.state.run(run_id)?.info.clone())
    }

    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<RunInfo, MlError> {
        self.inner.lock().await.state.update_run(run_id, status)
    }

    async fn log_batch(&self, run_id: &str, batch: &LogBatch) -> Result<(), MlError> {
        self.inner.lock().await.state.log_batch(run_id, batch)
    }

    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: &[u8],
    ) -> Result<(), MlError> {
        validate_artifact_path(artifact_path)?;
        let mut inner = self.inner.lock().await;
        inner.state.run(run_id)?;
        inner.artifacts.insert(
            (run_id.to_string(), artifact_path.to_string()),
            contents.to_vec(),
        );
        Ok(())
    }

    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion, MlError> {
        self.inner
            .lock()
            .await
            .state
            .register_model(name, run_id, source)
    }
}
