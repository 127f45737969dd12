//! Training infrastructure — engine, callbacks, test-pass observers, runner.

pub mod accumulator;
pub mod callbacks;
pub mod metrics;
pub mod runner;
pub mod trainer;

pub use accumulator::{PassBuffers, TestMetricsCallback, TestPassObserver};
pub use callbacks::{CallbackAction, EarlyStoppingCallback, Monitor, TrainingCallback};
pub use metrics::TrainingMetrics;
pub use runner::{RunSummary, TrainingRunner};
pub use trainer::{TestResults, Trainer};
