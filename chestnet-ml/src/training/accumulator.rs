//! Test-pass metrics callback.
//!
//! [`TestMetricsCallback`] buffers every evaluation batch of a test pass and,
//! when the pass completes, concatenates the buffers, turns logits into
//! probabilities and hands them to a [`MetricsReporter`] inside the bound
//! tracking run.
//!
//! Run context at pass end:
//! - no run attached to the session: the bound run is entered for the
//!   duration of the report and the session is restored afterwards;
//! - a run is already attached: the report goes straight to it and no
//!   enter is attempted.

use crate::data::BatchOutput;
use crate::error::MlError;
use crate::eval::{ClassificationReporter, MetricsReporter, sigmoid_probabilities};
use crate::tracking::{RunBinding, TrackingSession};
use async_trait::async_trait;
use ndarray::{ArrayD, ArrayViewD, Axis, concatenate};
use tracing::{debug, info, warn};

/// Observer of the evaluation loop during a test pass.
#[async_trait]
pub trait TestPassObserver: Send {
    /// Called before the first batch of a pass.
    fn on_pass_start(&mut self) {}

    /// Called after every test batch, in batch order. `None` means the batch
    /// produced no output.
    fn on_batch_complete(&mut self, output: Option<&BatchOutput>);

    /// Called once after the last batch of the pass.
    async fn on_pass_complete(&mut self) -> Result<(), MlError>;
}

/// Per-batch logits and labels collected during one pass.
#[derive(Debug, Default, Clone)]
pub struct PassBuffers {
    pub predicted_logits: Vec<ArrayD<f32>>,
    pub true_labels: Vec<ArrayD<f32>>,
}

impl PassBuffers {
    pub fn push(&mut self, output: &BatchOutput) {
        self.predicted_logits.push(output.logits.clone());
        self.true_labels.push(output.labels.clone());
    }

    /// Number of buffered batches.
    pub fn len(&self) -> usize {
        self.predicted_logits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicted_logits.is_empty()
    }

    /// Concatenate along axis 0 into `(logits, labels)`.
    pub fn aggregate(self) -> Result<(ArrayD<f32>, ArrayD<f32>), MlError> {
        if self.is_empty() {
            return Err(MlError::no_data(
                "test pass completed without any batch outputs",
            ));
        }
        let logits = concat_rows(&self.predicted_logits, "logits")?;
        let labels = concat_rows(&self.true_labels, "labels")?;
        let (n_logits, n_labels) = (logits.len_of(Axis(0)), labels.len_of(Axis(0)));
        if n_logits != n_labels {
            return Err(MlError::shape_mismatch(
                format!("{n_logits} label rows"),
                format!("{n_labels}"),
            ));
        }
        Ok((logits, labels))
    }
}

fn concat_rows(parts: &[ArrayD<f32>], what: &str) -> Result<ArrayD<f32>, MlError> {
    if parts.iter().any(|p| p.ndim() == 0) {
        return Err(MlError::shape_mismatch(
            format!("{what} with a batch axis"),
            "0-d array",
        ));
    }
    let views: Vec<ArrayViewD<'_, f32>> = parts.iter().map(|p| p.view()).collect();
    concatenate(Axis(0), &views).map_err(|e| {
        let shapes: Vec<&[usize]> = parts.iter().map(|p| p.shape()).collect();
        MlError::shape_mismatch(
            format!("{what} batches with matching trailing dimensions"),
            format!("{shapes:?} ({e})"),
        )
    })
}

/// Collects test-pass outputs and publishes aggregate metrics into a run.
pub struct TestMetricsCallback<R: MetricsReporter = ClassificationReporter> {
    binding: RunBinding,
    reporter: R,
    buffers: PassBuffers,
}

impl TestMetricsCallback<ClassificationReporter> {
    pub fn new(binding: RunBinding) -> Self {
        Self::with_reporter(binding, ClassificationReporter::default())
    }
}

impl<R: MetricsReporter> TestMetricsCallback<R> {
    pub fn with_reporter(binding: RunBinding, reporter: R) -> Self {
        Self {
            binding,
            reporter,
            buffers: PassBuffers::default(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.binding.run_id
    }

    /// Batches buffered so far in the current pass.
    pub fn buffered_batches(&self) -> usize {
        self.buffers.len()
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    async fn report(
        &self,
        session: &TrackingSession,
        labels: &ArrayD<f32>,
        probabilities: &ArrayD<f64>,
    ) -> Result<(), MlError> {
        let record = self.reporter.calculate(labels, probabilities)?;
        self.reporter.publish(session, &record).await
    }
}

#[async_trait]
impl<R: MetricsReporter> TestPassObserver for TestMetricsCallback<R> {
    fn on_pass_start(&mut self) {
        // Left over from a pass that aborted before completing.
        if !self.buffers.is_empty() {
            warn!(
                run_id = %self.binding.run_id,
                stale_batches = self.buffers.len(),
                "Discarding batches from an unfinished test pass"
            );
            self.buffers = PassBuffers::default();
        }
    }

    fn on_batch_complete(&mut self, output: Option<&BatchOutput>) {
        if let Some(output) = output {
            self.buffers.push(output);
        }
    }

    async fn on_pass_complete(&mut self) -> Result<(), MlError> {
        // Buffers leave the callback before anything can fail.
        let buffers = std::mem::take(&mut self.buffers);
        let batches = buffers.len();
        let (logits, labels) = buffers.aggregate()?;
        let probabilities = sigmoid_probabilities(&logits);
        info!(
            run_id = %self.binding.run_id,
            batches,
            samples = logits.len_of(Axis(0)),
            "Test pass complete, reporting metrics"
        );

        let session = self.binding.session.as_ref();
        match session.active_run() {
            Some(active) => {
                if active.run_id != self.binding.run_id {
                    warn!(
                        bound = %self.binding.run_id,
                        active = %active.run_id,
                        "Reporting into the active run, which differs from the bound run"
                    );
                }
                self.report(session, &labels, &probabilities).await
            }
            None => {
                debug!(run_id = %self.binding.run_id, "No active run, re-entering bound run");
                let scope = session.enter_run(&self.binding.run_id).await?;
                let result = self.report(session, &labels, &probabilities).await;
                scope.leave();
                result
            }
        }
    }
}
