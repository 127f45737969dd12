//! Experiment tracking — backend trait, run records, and the in-process session.
//!
//! A [`TrackingBackend`] talks to a store (an MLflow server, a local JSON
//! store, or memory). A [`TrackingSession`] wraps one backend and owns the
//! explicit "active run" slot that the orchestrator, the training logger and
//! the test-metrics callback share.

pub mod file_store;
pub mod logger;
pub mod memory;
pub mod mlflow;
pub mod session;

pub use file_store::FileStore;
pub use logger::RunLogger;
pub use memory::InMemoryBackend;
pub use mlflow::MlflowClient;
pub use session::{RunBinding, RunScope, TrackingSession};

use crate::error::MlError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle status of a tracking run (MLflow naming).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Scheduled,
    Finished,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Finished => "FINISHED",
            RunStatus::Failed => "FAILED",
            RunStatus::Killed => "KILLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Finished | RunStatus::Failed | RunStatus::Killed
        )
    }
}

/// Identity and lifecycle metadata of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
    #[serde(default)]
    pub run_name: String,
    pub status: RunStatus,
    #[serde(default)]
    pub artifact_uri: String,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
}

/// One metric observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub step: i64,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: f64, step: i64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: now_millis(),
            step,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTag {
    pub key: String,
    pub value: String,
}

/// Metrics, params and tags written in one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: Vec<Param>,
    #[serde(default)]
    pub tags: Vec<RunTag>,
}

impl LogBatch {
    pub fn metrics(metrics: Vec<Metric>) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    pub fn params<'a>(params: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        Self {
            params: params
                .into_iter()
                .map(|(k, v)| Param {
                    key: k.clone(),
                    value: v.clone(),
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.params.is_empty() && self.tags.is_empty()
    }
}

/// A registered model version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub run_id: String,
}

/// A store that records runs, metrics, artifacts and model versions.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    /// Resolve an experiment id by name, creating the experiment if missing.
    async fn get_or_create_experiment(&self, name: &str) -> Result<String, MlError>;

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError>;

    async fn get_run(&self, run_id: &str) -> Result<RunInfo, MlError>;

    /// Set the run status; terminal statuses also stamp `end_time`.
    async fn update_run(&self, run_id: &str, status: RunStatus) -> Result<RunInfo, MlError>;

    async fn log_batch(&self, run_id: &str, batch: &LogBatch) -> Result<(), MlError>;

    /// Store `contents` at `artifact_path` (relative, `/`-separated) under the run.
    async fn log_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        contents: &[u8],
    ) -> Result<(), MlError>;

    /// Register a new version of `name` whose files live at `source`.
    async fn register_model(
        &self,
        name: &str,
        run_id: &str,
        source: &str,
    ) -> Result<ModelVersion, MlError>;
}

/// Build the backend addressed by `tracking_uri`.
///
/// - `http://`, `https://` -> MLflow REST API
/// - `memory:` -> process-local store
/// - `file:<path>`, `file://<path>` or a bare path -> local JSON store
pub fn connect(tracking_uri: &str, timeout: Duration) -> Result<Arc<dyn TrackingBackend>, MlError> {
    let uri = tracking_uri.trim();
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(Arc::new(MlflowClient::new(uri, timeout)?));
    }
    if uri == "memory:" || uri == "memory://" {
        return Ok(Arc::new(InMemoryBackend::new()));
    }
    let path = if let Some(rest) = uri.strip_prefix("file://") {
        rest
    } else if let Some(rest) = uri.strip_prefix("file:") {
        rest
    } else if uri.contains("://") {
        return Err(MlError::config(format!(
            "unsupported tracking URI scheme: {uri}"
        )));
    } else {
        uri
    };
    if path.is_empty() {
        return Err(MlError::config("file tracking URI has no path"));
    }
    Ok(Arc::new(FileStore::new(PathBuf::from(path))))
}

/// Reject artifact paths that are empty, absolute, or escape the run directory.
pub(crate) fn validate_artifact_path(artifact_path: &str) -> Result<PathBuf, MlError> {
    let path = Path::new(artifact_path);
    if artifact_path.is_empty() {
        return Err(MlError::invalid_input("artifact path is empty"));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(MlError::invalid_input(format!(
                    "artifact path must be relative and stay inside the run: {artifact_path}"
                )));
            }
        }
    }
    Ok(path.to_path_buf())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_names() {
        let json = serde_json::to_string(&RunStatus::Finished).unwrap();
        assert_eq!(json, "\"FINISHED\"");
        let status: RunStatus = serde_json::from_str("\"RUNNING\"").unwrap();
        assert_eq!(status, RunStatus::Running);
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_connect_selects_backend_by_scheme() {
        let timeout = Duration::from_secs(5);
        assert_eq!(connect("http://localhost:5000", timeout).unwrap().name(), "mlflow");
        assert_eq!(connect("memory:", timeout).unwrap().name(), "memory");
        assert_eq!(connect("file:/tmp/mlruns", timeout).unwrap().name(), "file");
        assert_eq!(connect("./mlruns", timeout).unwrap().name(), "file");
        assert!(matches!(
            connect("s3://bucket/runs", timeout),
            Err(MlError::Config(_))
        ));
    }

    #[test]
    fn test_validate_artifact_path() {
        assert!(validate_artifact_path("model/MLmodel").is_ok());
        assert!(validate_artifact_path("").is_err());
        assert!(validate_artifact_path("/etc/passwd").is_err());
        assert!(validate_artifact_path("model/../../escape").is_err());
    }
}
