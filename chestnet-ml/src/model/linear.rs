//! ChestNet-S: a single linear layer over flattened 28x28 images.

use super::{ArtifactFile, ClassifierModel, ModelArtifact};
use crate::data::{Batch, BatchOutput};
use crate::error::MlError;
use crate::eval::sigmoid;
use chrono::Utc;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const MODEL_TYPE: &str = "ChestNetS";
const FLAVOR: &str = "chestnet";

/// Linear multi-label classifier trained with BCE-with-logits and SGD.
///
/// Weight decay is decoupled from the gradient: after each gradient step the
/// weights (not the bias) shrink by `learning_rate * weight_decay`.
#[derive(Debug, Clone)]
pub struct ChestNetS {
    /// `[num_features, num_classes]`.
    weights: Array2<f32>,
    bias: Array1<f32>,
    learning_rate: f64,
    weight_decay: f64,
    seed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WeightsFile {
    model_type: String,
    num_features: usize,
    num_classes: usize,
    /// Row-major `[num_features][num_classes]`.
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct MlModelFile {
    artifact_path: String,
    flavors: BTreeMap<String, FlavorInfo>,
    model_uuid: String,
    utc_time_created: String,
}

#[derive(Debug, Serialize)]
struct FlavorInfo {
    model_type: String,
    data: String,
    sha256: String,
    num_features: usize,
    num_classes: usize,
}

impl ChestNetS {
    /// Uniform init in `[-1/sqrt(features), 1/sqrt(features))`, seeded.
    pub fn new(
        num_features: usize,
        num_classes: usize,
        learning_rate: f64,
        weight_decay: f64,
        seed: u64,
    ) -> Result<Self, MlError> {
        if num_features == 0 || num_classes == 0 {
            return Err(MlError::model("model needs at least one feature and one class"));
        }
        if !(learning_rate > 0.0) || weight_decay < 0.0 {
            return Err(MlError::model(format!(
                "invalid optimiser settings: lr={learning_rate}, weight_decay={weight_decay}"
            )));
        }
        let bound = 1.0 / (num_features as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let weights =
            Array2::from_shape_fn((num_features, num_classes), |_| rng.gen_range(-bound..bound));
        let bias = Array1::from_shape_fn(num_classes, |_| rng.gen_range(-bound..bound));
        Ok(Self {
            weights,
            bias,
            learning_rate,
            weight_decay,
            seed,
        })
    }

    pub fn num_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn num_classes(&self) -> usize {
        self.weights.ncols()
    }

    fn check_labels(&self, logits: &Array2<f32>, labels: &Array2<f32>) -> Result<(), MlError> {
        if logits.dim() != labels.dim() {
            return Err(MlError::shape_mismatch(
                format!("labels {:?}", logits.dim()),
                format!("{:?}", labels.dim()),
            ));
        }
        Ok(())
    }
}

/// Mean of `max(x, 0) - x*y + ln(1 + e^-|x|)`.
fn bce_with_logits(logits: &Array2<f32>, labels: &Array2<f32>) -> f64 {
    let n = logits.len().max(1) as f64;
    logits
        .iter()
        .zip(labels.iter())
        .map(|(&x, &y)| {
            let (x, y) = (f64::from(x), f64::from(y));
            x.max(0.0) - x * y + (-x.abs()).exp().ln_1p()
        })
        .sum::<f64>()
        / n
}

impl ClassifierModel for ChestNetS {
    fn name(&self) -> &str {
        MODEL_TYPE
    }

    fn hyperparams(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("model_type".to_string(), MODEL_TYPE.to_string()),
            ("num_features".to_string(), self.num_features().to_string()),
            ("num_classes".to_string(), self.num_classes().to_string()),
            ("lr".to_string(), self.learning_rate.to_string()),
            ("weight_decay".to_string(), self.weight_decay.to_string()),
            ("init_seed".to_string(), self.seed.to_string()),
        ])
    }

    fn forward(&self, images: &Array2<f32>) -> Result<Array2<f32>, MlError> {
        if images.ncols() != self.num_features() {
            return Err(MlError::shape_mismatch(
                format!("{} features", self.num_features()),
                format!("{}", images.ncols()),
            ));
        }
        Ok(images.dot(&self.weights) + &self.bias)
    }

    fn loss(&self, logits: &Array2<f32>, labels: &Array2<f32>) -> Result<f64, MlError> {
        self.check_labels(logits, labels)?;
        Ok(bce_with_logits(logits, labels))
    }

    fn train_step(&mut self, batch: &Batch) -> Result<f64, MlError> {
        if batch.is_empty() {
            return Ok(0.0);
        }
        let logits = self.forward(&batch.images)?;
        let loss = self.loss(&logits, &batch.labels)?;

        let scale = 1.0 / logits.len() as f32;
        let residual = logits.mapv(|x| sigmoid(f64::from(x)) as f32) - &batch.labels;
        let grad_w = batch.images.t().dot(&residual) * scale;
        let grad_b = residual.sum_axis(Axis(0)) * scale;

        let lr = self.learning_rate as f32;
        let decay = 1.0 - lr * self.weight_decay as f32;
        self.weights.scaled_add(-lr, &grad_w);
        self.weights.mapv_inplace(|w| w * decay);
        self.bias.scaled_add(-lr, &grad_b);

        if !loss.is_finite() {
            return Err(MlError::training(format!("non-finite training loss {loss}")));
        }
        Ok(loss)
    }

    fn eval_step(&self, batch: &Batch) -> Result<(f64, Option<BatchOutput>), MlError> {
        if batch.is_empty() {
            return Ok((0.0, None));
        }
        let logits = self.forward(&batch.images)?;
        let loss = self.loss(&logits, &batch.labels)?;
        Ok((loss, Some(BatchOutput::new(logits, batch.labels.view()))))
    }

    fn export(&self) -> Result<ModelArtifact, MlError> {
        let weights = WeightsFile {
            model_type: MODEL_TYPE.to_string(),
            num_features: self.num_features(),
            num_classes: self.num_classes(),
            weights: self.weights.outer_iter().map(|row| row.to_vec()).collect(),
            bias: self.bias.to_vec(),
        };
        let weights_json = serde_json::to_vec_pretty(&weights)?;
        let digest = format!("{:x}", Sha256::digest(&weights_json));

        let mlmodel = MlModelFile {
            artifact_path: "model".to_string(),
            flavors: BTreeMap::from([(
                FLAVOR.to_string(),
                FlavorInfo {
                    model_type: MODEL_TYPE.to_string(),
                    data: "weights.json".to_string(),
                    sha256: digest,
                    num_features: self.num_features(),
                    num_classes: self.num_classes(),
                },
            )]),
            model_uuid: uuid::Uuid::new_v4().simple().to_string(),
            utc_time_created: Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        };

        Ok(ModelArtifact {
            artifact_path: "model".to_string(),
            files: vec![
                ArtifactFile {
                    path: "model/MLmodel".to_string(),
                    contents: serde_yaml::to_string(&mlmodel)?.into_bytes(),
                },
                ArtifactFile {
                    path: "model/weights.json".to_string(),
                    contents: weights_json,
                },
            ],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn toy_batch() -> Batch {
        Batch {
            images: arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]]),
            labels: arr2(&[[1.0], [0.0], [1.0], [0.0]]),
        }
    }

    #[test]
    fn test_init_is_seeded() {
        let a = ChestNetS::new(4, 2, 0.1, 0.0, 9).unwrap();
        let b = ChestNetS::new(4, 2, 0.1, 0.0, 9).unwrap();
        let c = ChestNetS::new(4, 2, 0.1, 0.0, 10).unwrap();
        assert_eq!(a.weights, b.weights);
        assert_ne!(a.weights, c.weights);
        assert!(a.weights.iter().all(|w| w.abs() <= 0.5));
    }

    #[test]
    fn test_bce_matches_closed_form() {
        let logits = arr2(&[[0.0_f32]]);
        let labels = arr2(&[[1.0_f32]]);
        assert!((bce_with_logits(&logits, &labels) - std::f64::consts::LN_2).abs() < 1e-9);
        // Large logits stay finite.
        let big = arr2(&[[80.0_f32, -80.0]]);
        let y = arr2(&[[0.0_f32, 1.0]]);
        assert!((bce_with_logits(&big, &y) - 80.0).abs() < 1e-6);
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut model = ChestNetS::new(2, 1, 1.0, 1e-4, 3).unwrap();
        let batch = toy_batch();
        let first = model.train_step(&batch).unwrap();
        let mut last = first;
        for _ in 0..50 {
            last = model.train_step(&batch).unwrap();
        }
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_eval_step_outputs_and_empty_batch() {
        let model = ChestNetS::new(2, 1, 0.1, 0.0, 0).unwrap();
        let (loss, out) = model.eval_step(&toy_batch()).unwrap();
        assert!(loss > 0.0);
        let out = out.unwrap();
        assert_eq!(out.logits.shape(), &[4, 1]);
        assert_eq!(out.labels.shape(), &[4, 1]);

        let empty = Batch {
            images: Array2::zeros((0, 2)),
            labels: Array2::zeros((0, 1)),
        };
        assert_eq!(model.eval_step(&empty).unwrap(), (0.0, None));
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let model = ChestNetS::new(3, 1, 0.1, 0.0, 0).unwrap();
        let err = model.forward(&Array2::zeros((2, 4))).unwrap_err();
        assert!(matches!(err, MlError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_export_writes_weights_and_mlmodel() {
        let model = ChestNetS::new(2, 3, 0.1, 0.0, 1).unwrap();
        let artifact = model.export().unwrap();
        let weights = artifact.file("model/weights.json").unwrap();
        let parsed: WeightsFile = serde_json::from_slice(&weights.contents).unwrap();
        assert_eq!(parsed.weights.len(), 2);
        assert_eq!(parsed.bias.len(), 3);

        let mlmodel = artifact.file("model/MLmodel").unwrap();
        let yaml: serde_yaml::Value = serde_yaml::from_slice(&mlmodel.contents).unwrap();
        let expected = format!("{:x}", Sha256::digest(&weights.contents));
        assert_eq!(
            yaml["flavors"]["chestnet"]["sha256"].as_str(),
            Some(expected.as_str())
        );
        assert_eq!(yaml["artifact_path"].as_str(), Some("model"));
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(ChestNetS::new(0, 1, 0.1, 0.0, 0).is_err());
        assert!(ChestNetS::new(2, 1, 0.0, 0.0, 0).is_err());
        assert!(ChestNetS::new(2, 1, 0.1, -1.0, 0).is_err());
    }
}
