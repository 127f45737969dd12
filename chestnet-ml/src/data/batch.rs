//! Batch records passed between the data module, the model and the engine.

use ndarray::{Array2, ArrayBase, ArrayD, Axis, Data, Dimension};

/// One minibatch of flattened images and their multi-hot labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[batch_size, num_features]`, scaled to `[0, 1]`.
    pub images: Array2<f32>,
    /// `[batch_size, num_classes]`, 0.0 or 1.0.
    pub labels: Array2<f32>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an evaluation step hands to test-pass observers.
///
/// Both arrays are owned host copies, detached from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    /// `[batch_size, num_classes_or_1]` raw scores.
    pub logits: ArrayD<f32>,
    /// `[batch_size, ...]` ground truth.
    pub labels: ArrayD<f32>,
}

impl BatchOutput {
    pub fn new<S1, D1, S2, D2>(logits: ArrayBase<S1, D1>, labels: ArrayBase<S2, D2>) -> Self
    where
        S1: Data<Elem = f32>,
        D1: Dimension,
        S2: Data<Elem = f32>,
        D2: Dimension,
    {
        Self {
            logits: logits.to_owned().into_dyn(),
            labels: labels.to_owned().into_dyn(),
        }
    }

    /// Number of samples (length of axis 0).
    pub fn batch_size(&self) -> usize {
        self.logits.shape().first().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_batch_output_copies_views() {
        let logits = arr2(&[[2.0_f32], [-1.0]]);
        let labels = arr1(&[1.0_f32, 0.0]);
        let out = BatchOutput::new(logits.view(), labels.view());
        assert_eq!(out.batch_size(), 2);
        assert_eq!(out.logits.shape(), &[2, 1]);
        assert_eq!(out.labels.shape(), &[2]);
    }
}
