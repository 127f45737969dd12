//! Evaluation — classification metrics and the reporters that publish them.

pub mod classification;
pub mod reporter;

pub use classification::{ClassificationMetrics, sigmoid, sigmoid_probabilities};
pub use reporter::{ClassificationReporter, MetricsRecord, MetricsReporter};
