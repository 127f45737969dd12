//! The in-process tracking session and its explicit active-run slot.
//!
//! Nothing here is global: the orchestrator creates one [`TrackingSession`] and
//! hands it (inside a [`RunBinding`]) to whatever needs to write into a run.

use super::{LogBatch, Metric, RunInfo, RunStatus, RunTag, TrackingBackend};
use crate::error::MlError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// One connection to a tracking store plus the run currently attached in this process.
pub struct TrackingSession {
    backend: Arc<dyn TrackingBackend>,
    tracking_uri: String,
    active: Mutex<Option<RunInfo>>,
}

impl TrackingSession {
    pub fn new(backend: Arc<dyn TrackingBackend>, tracking_uri: impl Into<String>) -> Self {
        Self {
            backend,
            tracking_uri: tracking_uri.into(),
            active: Mutex::new(None),
        }
    }

    /// Connect to the backend addressed by `tracking_uri`.
    pub fn connect(tracking_uri: &str, timeout: Duration) -> Result<Self, MlError> {
        Ok(Self::new(super::connect(tracking_uri, timeout)?, tracking_uri))
    }

    pub fn tracking_uri(&self) -> &str {
        &self.tracking_uri
    }

    pub fn backend(&self) -> &Arc<dyn TrackingBackend> {
        &self.backend
    }

    fn slot(&self) -> MutexGuard<'_, Option<RunInfo>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The run currently attached in this process, if any.
    pub fn active_run(&self) -> Option<RunInfo> {
        self.slot().clone()
    }

    /// Create a run under `experiment_name` and make it the active run.
    pub async fn start_run(
        &self,
        experiment_name: &str,
        run_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<RunInfo, MlError> {
        if let Some(active) = self.active_run() {
            return Err(MlError::tracking(format!(
                "run {} is already active; end it before starting another",
                active.run_id
            )));
        }
        let experiment_id = self.backend.get_or_create_experiment(experiment_name).await?;
        let tags: Vec<RunTag> = tags
            .iter()
            .map(|(k, v)| RunTag {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        let run = self
            .backend
            .create_run(&experiment_id, run_name, &tags)
            .await?;
        info!(
            run_id = %run.run_id,
            experiment = experiment_name,
            tracking_uri = %self.tracking_uri,
            "Started tracking run"
        );
        *self.slot() = Some(run.clone());
        Ok(run)
    }

    /// Detach the active run and set its final status.
    ///
    /// The slot is cleared even if the status update fails.
    pub async fn end_run(&self, status: RunStatus) -> Result<RunInfo, MlError> {
        let run = self
            .slot()
            .take()
            .ok_or_else(|| MlError::tracking("no active run to end"))?;
        let updated = self.backend.update_run(&run.run_id, status).await?;
        info!(run_id = %run.run_id, status = status.as_str(), "Ended tracking run");
        Ok(updated)
    }

    /// Attach to an existing run for the lifetime of the returned scope.
    ///
    /// Fails if another run is already attached; callers that may be inside an
    /// active run should check [`active_run`](Self::active_run) first.
    pub async fn enter_run(&self, run_id: &str) -> Result<RunScope<'_>, MlError> {
        if let Some(active) = self.active_run() {
            return Err(MlError::tracking(format!(
                "cannot enter run {run_id}: run {} is already active",
                active.run_id
            )));
        }
        let run = self.backend.get_run(run_id).await?;
        let mut slot = self.slot();
        let previous = slot.replace(run);
        drop(slot);
        debug!(run_id, "Entered tracking run");
        Ok(RunScope {
            session: self,
            previous,
            run_id: run_id.to_string(),
        })
    }

    fn active_run_id(&self) -> Result<String, MlError> {
        self.slot()
            .as_ref()
            .map(|run| run.run_id.clone())
            .ok_or_else(|| MlError::tracking("no tracking run is attached"))
    }

    /// Log metrics into the active run.
    pub async fn log_metrics(&self, metrics: Vec<Metric>) -> Result<(), MlError> {
        let run_id = self.active_run_id()?;
        self.backend
            .log_batch(&run_id, &LogBatch::metrics(metrics))
            .await
    }

    /// Log params into the active run.
    pub async fn log_params(&self, params: &BTreeMap<String, String>) -> Result<(), MlError> {
        let run_id = self.active_run_id()?;
        self.backend.log_batch(&run_id, &LogBatch::params(params)).await
    }

    /// Upload an artifact into the active run.
    pub async fn log_artifact(&self, artifact_path: &str, contents: &[u8]) -> Result<(), MlError> {
        let run_id = self.active_run_id()?;
        self.backend
            .log_artifact(&run_id, artifact_path, contents)
            .await
    }
}

/// A run attached by [`TrackingSession::enter_run`].
///
/// Dropping the scope (or calling [`leave`](Self::leave)) puts the session's
/// active-run slot back to what it was before entering.
pub struct RunScope<'a> {
    session: &'a TrackingSession,
    previous: Option<RunInfo>,
    run_id: String,
}

impl RunScope<'_> {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn leave(self) {}
}

impl std::fmt::Debug for RunScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScope")
            .field("run_id", &self.run_id)
            .field("previous", &self.previous.as_ref().map(|r| r.run_id.as_str()))
            .finish()
    }
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        *self.session.slot() = self.previous.take();
        debug!(run_id = %self.run_id, "Left tracking run");
    }
}

/// Everything a component needs to write into one specific run.
#[derive(Clone)]
pub struct RunBinding {
    pub session: Arc<TrackingSession>,
    pub run_id: String,
    pub tracking_uri: String,
}

impl RunBinding {
    pub fn new(session: Arc<TrackingSession>, run_id: impl Into<String>) -> Self {
        let tracking_uri = session.tracking_uri().to_string();
        Self {
            session,
            run_id: run_id.into(),
            tracking_uri,
        }
    }
}

impl std::fmt::Debug for RunBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunBinding")
            .field("run_id", &self.run_id)
            .field("tracking_uri", &self.tracking_uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::InMemoryBackend;

    fn session() -> (Arc<InMemoryBackend>, TrackingSession) {
        let backend = Arc::new(InMemoryBackend::new());
        let session = TrackingSession::new(backend.clone(), "memory:");
        (backend, session)
    }

    #[tokio::test]
    async fn test_start_and_end_run() {
        let (backend, session) = session();
        let run = session
            .start_run("xray", "baseline", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(session.active_run().unwrap().run_id, run.run_id);

        let err = session
            .start_run("xray", "second", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_tracking());

        session.end_run(RunStatus::Finished).await.unwrap();
        assert!(session.active_run().is_none());
        assert_eq!(
            backend.run(&run.run_id).await.unwrap().info.status,
            RunStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_enter_run_restores_inactive_state() {
        let (backend, session) = session();
        let exp = backend.get_or_create_experiment("xray").await.unwrap();
        let run = backend.create_run(&exp, "closed", &[]).await.unwrap();

        {
            let scope = session.enter_run(&run.run_id).await.unwrap();
            assert_eq!(scope.run_id(), run.run_id);
            assert!(format!("{scope:?}").contains(&run.run_id));
            assert_eq!(session.active_run().unwrap().run_id, run.run_id);
            session
                .log_metrics(vec![Metric::new("test_accuracy", 0.8, 0)])
                .await
                .unwrap();
        }
        assert!(session.active_run().is_none());
        assert_eq!(
            backend
                .run(&run.run_id)
                .await
                .unwrap()
                .latest_metric("test_accuracy"),
            Some(0.8)
        );
    }

    #[tokio::test]
    async fn test_enter_run_refuses_nesting() {
        let (_backend, session) = session();
        let run = session
            .start_run("xray", "outer", &BTreeMap::new())
            .await
            .unwrap();
        assert!(session.enter_run(&run.run_id).await.is_err());
        assert_eq!(session.active_run().unwrap().run_id, run.run_id);
    }

    #[tokio::test]
    async fn test_enter_unknown_run_leaves_no_trace() {
        let (_backend, session) = session();
        assert!(session.enter_run("missing").await.unwrap_err().is_tracking());
        assert!(session.active_run().is_none());
    }

    #[tokio::test]
    async fn test_log_without_attached_run_fails() {
        let (_backend, session) = session();
        let err = session
            .log_metrics(vec![Metric::new("x", 1.0, 0)])
            .await
            .unwrap_err();
        assert!(err.is_tracking());
    }
}
