//! Error types for the chestnet-ml crate.

use thiserror::Error;

/// Top-level error type for training, evaluation and tracking operations.
#[derive(Debug, Error)]
pub enum MlError {
    /// A test pass finished without a single gradable batch.
    #[error("No data: {0}")]
    NoData(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// The tracking backend could not be reached, refused a write, or no run
    /// was attached when one was required.
    #[error("Tracking backend error: {0}")]
    TrackingBackend(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<reqwest::Error> for MlError {
    fn from(err: reqwest::Error) -> Self {
        Self::TrackingBackend(err.to_string())
    }
}

impl MlError {
    pub fn no_data(msg: impl Into<String>) -> Self {
        Self::NoData(msg.into())
    }

    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn tracking(msg: impl Into<String>) -> Self {
        Self::TrackingBackend(msg.into())
    }

    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether this error came from the tracking backend.
    pub fn is_tracking(&self) -> bool {
        matches!(self, Self::TrackingBackend(_))
    }
}
