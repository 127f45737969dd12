//! Classifier models trained and evaluated by the engine.

pub mod linear;

pub use linear::ChestNetS;

use crate::data::{Batch, BatchOutput};
use crate::error::MlError;
use ndarray::Array2;
use std::collections::BTreeMap;

/// A multi-label classifier with a training and an evaluation step.
pub trait ClassifierModel: Send + Sync {
    fn name(&self) -> &str;

    /// Hyperparameters logged as run params.
    fn hyperparams(&self) -> BTreeMap<String, String>;

    /// Raw logits, `[batch, num_classes]`.
    fn forward(&self, images: &Array2<f32>) -> Result<Array2<f32>, MlError>;

    /// Mean loss of `logits` against `labels`.
    fn loss(&self, logits: &Array2<f32>, labels: &Array2<f32>) -> Result<f64, MlError>;

    /// One optimisation step; returns the loss before the update.
    fn train_step(&mut self, batch: &Batch) -> Result<f64, MlError>;

    /// Loss plus detached outputs for observers. Empty batches yield `(0.0, None)`.
    fn eval_step(&self, batch: &Batch) -> Result<(f64, Option<BatchOutput>), MlError>;

    /// Files making up the logged model.
    fn export(&self) -> Result<ModelArtifact, MlError>;
}

/// One file of an exported model, relative to the run's artifact root.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactFile {
    pub path: String,
    pub contents: Vec<u8>,
}

/// An exported model: its directory under the artifact root and the files in it.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelArtifact {
    pub artifact_path: String,
    pub files: Vec<ArtifactFile>,
}

impl ModelArtifact {
    pub fn file(&self, path: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.path == path)
    }
}
