//! # chestnet-ml — chest X-ray classifier training with experiment tracking
//!
//! Trains a multi-label classifier on ChestMNIST and records the run in an
//! MLflow-compatible tracking store: hyperparameters, per-step and per-epoch
//! losses, test-pass classification metrics, the exported model and a
//! registered model version.
//!
//! The pieces, leaf to root:
//! - [`tracking`]: backends (MLflow REST, local file store, memory) and the
//!   explicit [`TrackingSession`] holding the active run.
//! - [`eval`]: classification metrics and the reporter that publishes them.
//! - [`data`] and [`model`]: the dataset module and the `ChestNetS` model.
//! - [`training`]: the engine, the test-pass metrics callback and the
//!   [`TrainingRunner`] that owns the run.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Tracking and evaluation
pub mod eval;
pub mod tracking;

// Data, model, engine
pub mod data;
pub mod model;
pub mod training;

// Re-exports
pub use config::{ChestnetConfig, load_config};
pub use data::{ChestDataModule, DataModule};
pub use error::MlError;
pub use model::{ChestNetS, ClassifierModel};
pub use tracking::{RunBinding, TrackingSession};
pub use training::{RunSummary, TestMetricsCallback, TrainingRunner};
