//! Configuration for training runs.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! Configuration is loaded from `~/.config/chestnet/chestnet.toml` and/or
//! `chestnet.toml` in the workspace directory, then overridden by
//! `CHESTNET_`-prefixed environment variables (`CHESTNET_TRAINING__NUM_EPOCHS=3`).

use crate::error::MlError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the config file looked up in the user config dir and the workspace.
pub const CONFIG_FILE_NAME: &str = "chestnet.toml";

/// Top-level configuration. Built once before the run starts and never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChestnetConfig {
    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Dataset and tracking locations.
    #[serde(default)]
    pub paths: PathConfig,
    /// Experiment tracking settings.
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Maximum number of epochs.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Early stopping patience (epochs without `val_loss` improvement).
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Minimum `val_loss` decrease that counts as an improvement.
    #[serde(default)]
    pub min_delta: f64,
    /// Seed for weight init and per-epoch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Number of binary finding labels per image.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Log `train_loss` to the tracking run every N optimizer steps.
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            patience: default_patience(),
            min_delta: 0.0,
            seed: default_seed(),
            num_classes: default_num_classes(),
            log_every_n_steps: default_log_every_n_steps(),
        }
    }
}

fn default_num_epochs() -> usize {
    3
}

fn default_batch_size() -> usize {
    64
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    1e-5
}

fn default_patience() -> usize {
    5
}

fn default_seed() -> u64 {
    42
}

fn default_num_classes() -> usize {
    14
}

fn default_log_every_n_steps() -> usize {
    10
}

/// Dataset and tracking server locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Directory holding the dataset archive.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// ChestMNIST `.npz` archive name inside `data_dir`.
    #[serde(default = "default_dataset_file")]
    pub dataset_file: String,
    /// Tracking backend URI: `http(s)://` for an MLflow server, `file:` for a
    /// local store, `memory:` for a throwaway in-process store.
    #[serde(default = "default_tracking_uri")]
    pub mlflow_tracking_uri: String,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dataset_file: default_dataset_file(),
            mlflow_tracking_uri: default_tracking_uri(),
        }
    }
}

impl PathConfig {
    pub fn dataset_path(&self) -> PathBuf {
        self.data_dir.join(&self.dataset_file)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_dataset_file() -> String {
    "chestmnist.npz".to_string()
}

fn default_tracking_uri() -> String {
    "http://localhost:5000".to_string()
}

/// Experiment tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_experiment_name")]
    pub experiment_name: String,
    #[serde(default = "default_run_name")]
    pub run_name: String,
    /// Name the trained model is registered under.
    #[serde(default = "default_registered_model_name")]
    pub registered_model_name: String,
    /// Upload the trained model and register a version after the test pass.
    #[serde(default = "default_true")]
    pub log_model: bool,
    /// HTTP timeout for tracking server requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Tags attached to the run at creation.
    #[serde(default = "default_tags")]
    pub tags: BTreeMap<String, String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            experiment_name: default_experiment_name(),
            run_name: default_run_name(),
            registered_model_name: default_registered_model_name(),
            log_model: true,
            request_timeout_secs: default_request_timeout(),
            tags: default_tags(),
        }
    }
}

fn default_experiment_name() -> String {
    "ChestXRayPytorchLightning".to_string()
}

fn default_run_name() -> String {
    "chestnet-s baseline".to_string()
}

fn default_registered_model_name() -> String {
    "chest_xray_classifier".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    30
}

fn default_tags() -> BTreeMap<String, String> {
    [
        ("dataset", "ChestMNIST"),
        ("purpose", "production"),
        ("version", "1.0.0"),
        ("author", "pgryko"),
        ("final_activation", "logits"),
        ("modifications", "Without transforms"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl ChestnetConfig {
    /// Reject configurations that cannot produce a meaningful run.
    pub fn validate(&self) -> Result<(), MlError> {
        let t = &self.training;
        if t.num_epochs == 0 {
            return Err(MlError::config("training.num_epochs must be at least 1"));
        }
        if t.batch_size == 0 {
            return Err(MlError::config("training.batch_size must be at least 1"));
        }
        if t.num_classes == 0 {
            return Err(MlError::config("training.num_classes must be at least 1"));
        }
        if !(t.learning_rate.is_finite() && t.learning_rate > 0.0) {
            return Err(MlError::config(format!(
                "training.learning_rate must be positive, got {}",
                t.learning_rate
            )));
        }
        if !(t.weight_decay.is_finite() && t.weight_decay >= 0.0) {
            return Err(MlError::config(format!(
                "training.weight_decay must be non-negative, got {}",
                t.weight_decay
            )));
        }
        if self.paths.mlflow_tracking_uri.trim().is_empty() {
            return Err(MlError::config("paths.mlflow_tracking_uri is empty"));
        }
        if self.tracking.experiment_name.trim().is_empty() {
            return Err(MlError::config("tracking.experiment_name is empty"));
        }
        Ok(())
    }

    /// Hyperparameters logged as run params.
    pub fn hyperparams(&self) -> BTreeMap<String, String> {
        let t = &self.training;
        BTreeMap::from([
            ("num_epochs".to_string(), t.num_epochs.to_string()),
            ("batch_size".to_string(), t.batch_size.to_string()),
            ("learning_rate".to_string(), t.learning_rate.to_string()),
            ("weight_decay".to_string(), t.weight_decay.to_string()),
            ("patience".to_string(), t.patience.to_string()),
            ("min_delta".to_string(), t.min_delta.to_string()),
            ("seed".to_string(), t.seed.to_string()),
            ("num_classes".to_string(), t.num_classes.to_string()),
        ])
    }
}

/// Load configuration from defaults, config files and environment.
///
/// `explicit` replaces the user/workspace file lookup when given.
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
) -> Result<ChestnetConfig, MlError> {
    let mut figment = Figment::from(Serialized::defaults(ChestnetConfig::default()));

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(MlError::not_found(format!(
                "config file {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    } else {
        // User-level config
        if let Some(dirs) = directories::ProjectDirs::from("dev", "chestnet", "chestnet") {
            let user_config = dirs.config_dir().join(CONFIG_FILE_NAME);
            if user_config.exists() {
                figment = figment.merge(Toml::file(&user_config));
            }
        }

        // Workspace-level config
        if let Some(ws) = workspace {
            let ws_config = ws.join(CONFIG_FILE_NAME);
            if ws_config.exists() {
                figment = figment.merge(Toml::file(&ws_config));
            }
        }
    }

    figment = figment.merge(Env::prefixed("CHESTNET_").split("__"));

    let config: ChestnetConfig = figment
        .extract()
        .map_err(|e| MlError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ChestnetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.training.num_epochs, 3);
        assert_eq!(config.tracking.registered_model_name, "chest_xray_classifier");
        assert_eq!(config.tracking.tags["dataset"], "ChestMNIST");
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let mut config = ChestnetConfig::default();
        config.training.batch_size = 0;
        assert!(matches!(config.validate(), Err(MlError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_negative_weight_decay() {
        let mut config = ChestnetConfig::default();
        config.training.weight_decay = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[training]
num_epochs = 7
learning_rate = 0.01

[paths]
mlflow_tracking_uri = "memory:"
"#,
        )
        .unwrap();

        let config = load_config(None, Some(&path)).unwrap();
        assert_eq!(config.training.num_epochs, 7);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.paths.mlflow_tracking_uri, "memory:");
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let err = load_config(None, Some(Path::new("/nonexistent/chestnet.toml"))).unwrap_err();
        assert!(matches!(err, MlError::NotFound(_)));
    }

    #[test]
    fn test_hyperparams_cover_training_settings() {
        let params = ChestnetConfig::default().hyperparams();
        assert_eq!(params["learning_rate"], "0.001");
        assert_eq!(params["num_epochs"], "3");
    }
}
