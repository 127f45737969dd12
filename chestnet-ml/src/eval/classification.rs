//! Binary / multi-label classification metrics over probability arrays.

use crate::error::MlError;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Threshold-based and ranking metrics for one evaluation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// Fraction of samples whose every label is predicted correctly.
    pub subset_accuracy: f64,
    /// Macro AUC over label columns that contain both classes.
    pub auc_roc: Option<f64>,
    /// Macro average precision over the same columns.
    pub average_precision: Option<f64>,
    /// `[[tn, fp], [fn, tp]]` summed over all label cells.
    pub confusion_matrix: [[usize; 2]; 2],
    pub num_samples: usize,
    pub num_labels: usize,
}

/// Numerically stable logistic function, clamped to the open interval (0, 1).
///
/// Only results that would round to exactly 0 or 1 are clamped, so large
/// negative logits keep their order.
pub fn sigmoid(x: f64) -> f64 {
    let p = if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    };
    p.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON / 2.0)
}

/// Elementwise sigmoid of raw logits.
pub fn sigmoid_probabilities(logits: &ArrayD<f32>) -> ArrayD<f64> {
    logits.mapv(|v| sigmoid(f64::from(v)))
}

impl ClassificationMetrics {
    /// Compute metrics for `labels` (0/1, any shape) against same-sized
    /// `probabilities`. Axis 0 indexes samples; remaining axes are label columns.
    pub fn compute(
        labels: &ArrayD<f32>,
        probabilities: &ArrayD<f64>,
        threshold: f64,
    ) -> Result<Self, MlError> {
        if labels.len() != probabilities.len() {
            return Err(MlError::shape_mismatch(
                format!("{} label values", probabilities.len()),
                format!("{} ({:?})", labels.len(), labels.shape()),
            ));
        }
        if probabilities.is_empty() {
            return Err(MlError::no_data("no samples to score"));
        }

        let num_samples = probabilities.shape().first().copied().unwrap_or(1);
        let num_labels = probabilities.len() / num_samples.max(1);
        let truth: Vec<bool> = labels.iter().map(|&y| y >= 0.5).collect();
        let scores: Vec<f64> = probabilities.iter().copied().collect();

        let mut cm = [[0usize; 2]; 2];
        let mut rows_correct = vec![true; num_samples];
        for (i, (&y, &p)) in truth.iter().zip(&scores).enumerate() {
            let predicted = p >= threshold;
            cm[usize::from(y)][usize::from(predicted)] += 1;
            if predicted != y {
                rows_correct[i / num_labels] = false;
            }
        }
        let [[tn, fp], [fn_, tp]] = cm;
        let total = scores.len() as f64;
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        let mut aucs = Vec::new();
        let mut aps = Vec::new();
        for col in 0..num_labels {
            let column: Vec<(f64, bool)> = (0..num_samples)
                .map(|row| {
                    let idx = row * num_labels + col;
                    (scores[idx], truth[idx])
                })
                .collect();
            if let Some(auc) = roc_auc(&column) {
                aucs.push(auc);
            }
            if let Some(ap) = average_precision(&column) {
                aps.push(ap);
            }
        }

        Ok(Self {
            accuracy: (tn + tp) as f64 / total,
            precision,
            recall,
            f1_score,
            subset_accuracy: rows_correct.iter().filter(|&&ok| ok).count() as f64
                / num_samples as f64,
            auc_roc: mean(&aucs),
            average_precision: mean(&aps),
            confusion_matrix: cm,
            num_samples,
            num_labels,
        })
    }

    pub fn hamming_loss(&self) -> f64 {
        1.0 - self.accuracy
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Area under the ROC curve via the rank-sum statistic, averaging ranks of ties.
/// `None` when the column has only one class.
pub fn roc_auc(column: &[(f64, bool)]) -> Option<f64> {
    let positives = column.iter().filter(|(_, y)| *y).count();
    let negatives = column.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut sorted: Vec<(f64, bool)> = column.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        // Ranks are 1-based; tied block i..=j shares the mean rank.
        let avg_rank = (i + j + 2) as f64 / 2.0;
        positive_rank_sum += avg_rank * sorted[i..=j].iter().filter(|(_, y)| *y).count() as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Average precision (area under the step precision-recall curve).
/// `None` when the column has no positives or no negatives.
pub fn average_precision(column: &[(f64, bool)]) -> Option<f64> {
    let positives = column.iter().filter(|(_, y)| *y).count();
    if positives == 0 || positives == column.len() {
        return None;
    }

    let mut sorted: Vec<(f64, bool)> = column.to_vec();
    sorted.sort_by(|a, b| b.0.total_cmp(&a.0));

    let (mut tp, mut fp) = (0usize, 0usize);
    let mut prev_recall = 0.0;
    let mut ap = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let threshold = sorted[i].0;
        while i < sorted.len() && sorted[i].0 == threshold {
            if sorted[i].1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let recall = tp as f64 / positives as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }
    Some(ap)
}
