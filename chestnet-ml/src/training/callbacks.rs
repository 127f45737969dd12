//! Training callbacks — early stopping on validation loss.

use crate::training::metrics::TrainingMetrics;
use serde::{Deserialize, Serialize};

/// Action a callback can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Trait for training callbacks.
pub trait TrainingCallback: Send + Sync {
    /// Called at the end of each epoch with epoch number and current metrics.
    fn on_epoch_end(&mut self, epoch: usize, metrics: &TrainingMetrics) -> CallbackAction;
}

/// Loss history an [`EarlyStoppingCallback`] watches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    #[default]
    ValLoss,
    TrainLoss,
}

impl Monitor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValLoss => "val_loss",
            Self::TrainLoss => "train_loss",
        }
    }
}

/// Stops training when the monitored loss has not improved by more than
/// `min_delta` for `patience` consecutive epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingCallback {
    #[serde(default)]
    pub monitor: Monitor,
    pub patience: usize,
    pub min_delta: f64,
    #[serde(skip)]
    counter: usize,
    #[serde(skip)]
    best_loss: Option<f64>,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            monitor: Monitor::ValLoss,
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn step(&mut self, loss: f64) -> CallbackAction {
        if loss.is_nan() {
            return CallbackAction::Stop;
        }
        match self.best_loss {
            None => {
                self.best_loss = Some(loss);
                CallbackAction::Continue
            }
            Some(best) => {
                if loss < best - self.min_delta {
                    self.best_loss = Some(loss);
                    self.counter = 0;
                    CallbackAction::Continue
                } else {
                    self.counter += 1;
                    if self.counter >= self.patience {
                        CallbackAction::Stop
                    } else {
                        CallbackAction::Continue
                    }
                }
            }
        }
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    fn on_epoch_end(&mut self, _epoch: usize, metrics: &TrainingMetrics) -> CallbackAction {
        let history = match self.monitor {
            Monitor::TrainLoss => &metrics.loss_history,
            Monitor::ValLoss => &metrics.val_loss_history,
        };
        match history.last() {
            Some(&loss) => self.step(loss),
            None => CallbackAction::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStoppingCallback::new(3, 0.01);
        assert_eq!(cb.step(0.5), CallbackAction::Continue); // first: sets best=0.5
        assert_eq!(cb.step(0.4), CallbackAction::Continue); // improves: best=0.4, counter=0
        assert_eq!(cb.step(0.4), CallbackAction::Continue); // no improve: counter=1
        assert_eq!(cb.step(0.395), CallbackAction::Continue); // within min_delta: counter=2
        assert_eq!(cb.step(0.4), CallbackAction::Stop); // counter=3 >= patience
        assert_eq!(cb.best_loss(), Some(0.4));
    }

    #[test]
    fn test_monitors_validation_loss() {
        let mut cb = EarlyStoppingCallback::new(1, 0.0);
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.9, Some(0.5));
        assert_eq!(cb.on_epoch_end(1, &metrics), CallbackAction::Continue);
        // Training loss improves but validation loss does not.
        metrics.record_epoch(0.1, Some(0.6));
        assert_eq!(cb.on_epoch_end(2, &metrics), CallbackAction::Stop);
    }

    #[test]
    fn test_monitors_training_loss() {
        let mut cb = EarlyStoppingCallback::new(1, 0.0).with_monitor(Monitor::TrainLoss);
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.9, Some(0.5));
        assert_eq!(cb.on_epoch_end(1, &metrics), CallbackAction::Continue);
        // Validation loss worsens but training loss keeps improving.
        metrics.record_epoch(0.1, Some(0.6));
        assert_eq!(cb.on_epoch_end(2, &metrics), CallbackAction::Continue);
        assert_eq!(cb.best_loss(), Some(0.1));
        metrics.record_epoch(0.2, Some(0.4));
        assert_eq!(cb.on_epoch_end(3, &metrics), CallbackAction::Stop);
    }

    #[test]
    fn test_unknown_monitor_rejected() {
        let parsed: Result<EarlyStoppingCallback, _> = serde_json::from_str(
            r#"{"monitor": "val_accuracy", "patience": 3, "min_delta": 0.0}"#,
        );
        assert!(parsed.is_err());

        let parsed: EarlyStoppingCallback =
            serde_json::from_str(r#"{"monitor": "train_loss", "patience": 3, "min_delta": 0.0}"#)
                .unwrap();
        assert_eq!(parsed.monitor, Monitor::TrainLoss);
        assert_eq!(parsed.monitor.as_str(), "train_loss");
    }

    #[test]
    fn test_nan_loss_stops() {
        let mut cb = EarlyStoppingCallback::new(5, 0.0);
        assert_eq!(cb.step(f64::NAN), CallbackAction::Stop);
    }

    #[test]
    fn test_no_validation_history_continues() {
        let mut cb = EarlyStoppingCallback::new(1, 0.0);
        assert_eq!(
            cb.on_epoch_end(1, &TrainingMetrics::default()),
            CallbackAction::Continue
        );
    }
}
