//! Execution engine: the fit loop and the test pass.

use super::accumulator::TestPassObserver;
use super::callbacks::{CallbackAction, TrainingCallback};
use super::metrics::TrainingMetrics;
use crate::config::TrainingConfig;
use crate::data::{Batch, DataModule};
use crate::error::MlError;
use crate::model::ClassifierModel;
use crate::tracking::RunLogger;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of one test pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    /// Sample-weighted mean loss over the pass.
    pub test_loss: f64,
    pub num_batches: usize,
    pub num_samples: usize,
}

/// Drives a [`ClassifierModel`] over a [`DataModule`].
pub struct Trainer {
    max_epochs: usize,
    log_every_n_steps: u64,
    global_step: u64,
    logger: Option<RunLogger>,
    callbacks: Vec<Box<dyn TrainingCallback>>,
    observers: Vec<Box<dyn TestPassObserver>>,
}

impl Trainer {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            max_epochs: config.num_epochs,
            log_every_n_steps: config.log_every_n_steps as u64,
            global_step: 0,
            logger: None,
            callbacks: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Send per-step and per-epoch metrics to `logger`.
    pub fn with_logger(mut self, logger: RunLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn TrainingCallback>) {
        self.callbacks.push(callback);
    }

    pub fn add_observer(&mut self, observer: Box<dyn TestPassObserver>) {
        self.observers.push(observer);
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    async fn log(&self, metrics: &[(&str, f64)]) -> Result<(), MlError> {
        match &self.logger {
            Some(logger) => logger.log_metrics(metrics, self.global_step as i64).await,
            None => Ok(()),
        }
    }

    /// Train for up to `num_epochs`, validating after each epoch.
    pub async fn fit(
        &mut self,
        model: &mut dyn ClassifierModel,
        data: &dyn DataModule,
    ) -> Result<TrainingMetrics, MlError> {
        let started = Instant::now();
        let mut metrics = TrainingMetrics::default();
        info!(model = model.name(), max_epochs = self.max_epochs, "Starting fit");

        for epoch in 0..self.max_epochs {
            let mut loss_sum = 0.0;
            let mut samples = 0usize;
            for batch in data.train_batches(epoch) {
                if batch.is_empty() {
                    continue;
                }
                let loss = model.train_step(&batch)?;
                loss_sum += loss * batch.len() as f64;
                samples += batch.len();
                self.global_step += 1;
                if self.log_every_n_steps > 0 && self.global_step % self.log_every_n_steps == 0 {
                    debug!(step = self.global_step, loss, "Training step");
                    self.log(&[("train_loss", loss)]).await?;
                }
            }
            if samples == 0 {
                return Err(MlError::training("training split produced no samples"));
            }
            let train_loss = loss_sum / samples as f64;
            let val_loss = mean_loss(model, data.val_batches())?;
            metrics.record_epoch(train_loss, val_loss);
            metrics.global_step = self.global_step;

            let mut epoch_metrics = vec![("train_loss_epoch", train_loss), ("epoch", epoch as f64)];
            if let Some(v) = val_loss {
                epoch_metrics.push(("val_loss", v));
            }
            self.log(&epoch_metrics).await?;
            info!(epoch, train_loss, val_loss, "Epoch complete");

            let mut stop = false;
            for callback in &mut self.callbacks {
                if callback.on_epoch_end(epoch + 1, &metrics) == CallbackAction::Stop {
                    stop = true;
                }
            }
            if stop {
                info!(epoch, best_epoch = metrics.best_epoch, "Early stopping");
                metrics.stopped_early = true;
                break;
            }
        }

        metrics.total_training_time_secs = started.elapsed().as_secs_f64();
        Ok(metrics)
    }

    /// Run one test pass, feeding every observer, then log `test_loss`.
    ///
    /// All observers are completed even if one fails; the first error is returned.
    pub async fn test(
        &mut self,
        model: &dyn ClassifierModel,
        data: &dyn DataModule,
    ) -> Result<TestResults, MlError> {
        for observer in &mut self.observers {
            observer.on_pass_start();
        }
        let mut loss_sum = 0.0;
        let mut num_batches = 0;
        let mut num_samples = 0;
        for batch in data.test_batches() {
            let (loss, output) = model.eval_step(&batch)?;
            for observer in &mut self.observers {
                observer.on_batch_complete(output.as_ref());
            }
            loss_sum += loss * batch.len() as f64;
            num_samples += batch.len();
            num_batches += 1;
        }

        let mut first_error = None;
        for observer in &mut self.observers {
            if let Err(e) = observer.on_pass_complete().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let test_loss = if num_samples > 0 {
            loss_sum / num_samples as f64
        } else {
            0.0
        };
        self.log(&[("test_loss", test_loss)]).await?;
        info!(test_loss, num_batches, num_samples, "Test pass complete");
        Ok(TestResults {
            test_loss,
            num_batches,
            num_samples,
        })
    }
}

/// Sample-weighted mean eval loss; `None` for an empty split.
fn mean_loss(
    model: &dyn ClassifierModel,
    batches: impl Iterator<Item = Batch>,
) -> Result<Option<f64>, MlError> {
    let mut loss_sum = 0.0;
    let mut samples = 0usize;
    for batch in batches {
        let (loss, _) = model.eval_step(&batch)?;
        loss_sum += loss * batch.len() as f64;
        samples += batch.len();
    }
    Ok((samples > 0).then(|| loss_sum / samples as f64))
}
