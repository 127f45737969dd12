//! Training-lifecycle logger bound to one run id.

use super::{LogBatch, Metric, RunBinding, TrackingBackend};
use crate::error::MlError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Writes training metrics and hyperparameters to an explicit run.
///
/// Unlike [`TrackingSession::log_metrics`](super::TrackingSession::log_metrics)
/// this never consults the active-run slot: the run id is fixed at construction.
#[derive(Clone)]
pub struct RunLogger {
    backend: Arc<dyn TrackingBackend>,
    run_id: String,
}

impl RunLogger {
    pub fn new(binding: &RunBinding) -> Self {
        Self {
            backend: binding.session.backend().clone(),
            run_id: binding.run_id.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn log_metrics(&self, metrics: &[(&str, f64)], step: i64) -> Result<(), MlError> {
        let metrics = metrics
            .iter()
            .map(|(key, value)| Metric::new(*key, *value, step))
            .collect();
        self.backend
            .log_batch(&self.run_id, &LogBatch::metrics(metrics))
            .await
    }

    pub async fn log_hyperparams(&self, params: &BTreeMap<String, String>) -> Result<(), MlError> {
        self.backend
            .log_batch(&self.run_id, &LogBatch::params(params))
            .await
    }
}
