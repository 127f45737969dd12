//! Training metrics tracking.

use serde::{Deserialize, Serialize};

/// Loss history of one fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: usize,
    pub global_step: u64,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub stopped_early: bool,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, loss: f64, val_loss: Option<f64>) {
        self.loss_history.push(loss);
        if let Some(vl) = val_loss {
            self.val_loss_history.push(vl);
        }
        self.epochs_completed += 1;

        let check_loss = val_loss.unwrap_or(loss);
        if self.best_loss.is_none_or(|best| check_loss < best) {
            self.best_loss = Some(check_loss);
            self.best_epoch = Some(self.epochs_completed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_training_metrics() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.5, Some(0.6));
        metrics.record_epoch(0.3, Some(0.4));
        metrics.record_epoch(0.2, Some(0.45));
        assert_eq!(metrics.epochs_completed, 3);
        assert_eq!(metrics.best_epoch, Some(2));
        assert_eq!(metrics.best_loss, Some(0.4));
    }

    #[test]
    fn test_falls_back_to_training_loss() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_epoch(0.5, None);
        assert!(metrics.val_loss_history.is_empty());
        assert_eq!(metrics.best_loss, Some(0.5));
    }
}
