//! Metrics reporters: turn a pass's labels and probabilities into named
//! metrics and publish them into the attached tracking run.

use super::classification::ClassificationMetrics;
use crate::error::MlError;
use crate::tracking::{Metric, TrackingSession};
use async_trait::async_trait;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Named scalar metrics computed over one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Tracking metrics with every name prefixed by `prefix`.
    pub fn to_metrics(&self, prefix: &str, step: i64) -> Vec<Metric> {
        self.values
            .iter()
            .map(|(name, value)| Metric::new(format!("{prefix}{name}"), *value, step))
            .collect()
    }
}

/// Computes and publishes the evaluation metrics of a finished pass.
#[async_trait]
pub trait MetricsReporter: Send + Sync {
    /// Compute metrics from ground-truth `labels` and `probabilities` in `(0, 1)`.
    fn calculate(
        &self,
        labels: &ArrayD<f32>,
        probabilities: &ArrayD<f64>,
    ) -> Result<MetricsRecord, MlError>;

    /// Write `record` into the session's active run.
    async fn publish(&self, session: &TrackingSession, record: &MetricsRecord)
    -> Result<(), MlError>;
}

/// Multi-label classification report (accuracy, precision/recall/F1, AUC, AP).
#[derive(Debug, Clone)]
pub struct ClassificationReporter {
    pub threshold: f64,
    /// Prepended to every metric name on publish.
    pub prefix: String,
}

impl Default for ClassificationReporter {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix: "test_".into(),
        }
    }
}

#[async_trait]
impl MetricsReporter for ClassificationReporter {
    fn calculate(
        &self,
        labels: &ArrayD<f32>,
        probabilities: &ArrayD<f64>,
    ) -> Result<MetricsRecord, MlError> {
        let m = ClassificationMetrics::compute(labels, probabilities, self.threshold)?;
        let mut record = MetricsRecord::default();
        record.insert("accuracy", m.accuracy);
        record.insert("precision", m.precision);
        record.insert("recall", m.recall);
        record.insert("f1_score", m.f1_score);
        record.insert("hamming_loss", m.hamming_loss());
        record.insert("subset_accuracy", m.subset_accuracy);
        if let Some(auc) = m.auc_roc {
            record.insert("auc_roc", auc);
        }
        if let Some(ap) = m.average_precision {
            record.insert("average_precision", ap);
        }
        record.insert("num_samples", m.num_samples as f64);
        Ok(record)
    }

    async fn publish(
        &self,
        session: &TrackingSession,
        record: &MetricsRecord,
    ) -> Result<(), MlError> {
        session.log_metrics(record.to_metrics(&self.prefix, 0)).await?;
        info!(
            metrics = record.len(),
            accuracy = record.get("accuracy"),
            auc_roc = record.get("auc_roc"),
            "Published evaluation metrics"
        );
        Ok(())
    }
}
