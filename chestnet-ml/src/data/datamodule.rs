//! ChestMNIST data module — train/val/test splits and minibatch iteration.

use super::batch::Batch;
use super::npy::{NpyArray, NpyDtype, read_npy};
use crate::error::MlError;
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

/// Source of training, validation and test minibatches.
pub trait DataModule: Send + Sync {
    /// Training batches for `epoch`, in a per-epoch shuffled order.
    fn train_batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch> + Send + '_>;

    /// Validation batches in dataset order.
    fn val_batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_>;

    /// Test batches in dataset order.
    fn test_batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_>;

    fn num_features(&self) -> usize;

    fn num_classes(&self) -> usize;
}

/// Images and labels of one split.
#[derive(Debug, Clone)]
pub struct Split {
    pub images: Array2<f32>,
    pub labels: Array2<f32>,
}

impl Split {
    pub fn new(images: Array2<f32>, labels: Array2<f32>) -> Result<Self, MlError> {
        if images.nrows() != labels.nrows() {
            return Err(MlError::dataset(format!(
                "split has {} images but {} label rows",
                images.nrows(),
                labels.nrows()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&self, batch_size: usize, order: Vec<usize>) -> impl Iterator<Item = Batch> + '_ {
        let chunks: Vec<Vec<usize>> = order.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect();
        chunks.into_iter().map(move |idx| Batch {
            images: self.images.select(Axis(0), &idx),
            labels: self.labels.select(Axis(0), &idx),
        })
    }
}

/// ChestMNIST (or any MedMNIST-layout) dataset held in memory.
pub struct ChestDataModule {
    train: Split,
    val: Split,
    test: Split,
    batch_size: usize,
    seed: u64,
}

impl ChestDataModule {
    /// Build from already-decoded splits.
    pub fn from_splits(
        train: Split,
        val: Split,
        test: Split,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, MlError> {
        let features = train.images.ncols();
        let classes = train.labels.ncols();
        for (name, split) in [("val", &val), ("test", &test)] {
            if split.images.ncols() != features || split.labels.ncols() != classes {
                return Err(MlError::dataset(format!(
                    "{name} split is [{}, {}] x [{}, {}], expected {features} features and {classes} classes",
                    split.images.nrows(),
                    split.images.ncols(),
                    split.labels.nrows(),
                    split.labels.ncols(),
                )));
            }
        }
        Ok(Self {
            train,
            val,
            test,
            batch_size,
            seed,
        })
    }

    /// Load a MedMNIST `.npz` archive (`{train,val,test}_{images,labels}.npy`).
    pub fn load(path: &Path, batch_size: usize, seed: u64) -> Result<Self, MlError> {
        let file = File::open(path).map_err(|e| {
            MlError::dataset(format!("cannot open dataset {}: {e}", path.display()))
        })?;
        let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

        let mut read_split = |name: &str| -> Result<Split, MlError> {
            let images = read_member(&mut archive, &format!("{name}_images"))?;
            let labels = read_member(&mut archive, &format!("{name}_labels"))?;
            Split::new(images_to_matrix(images)?, labels_to_matrix(labels)?)
        };
        let train = read_split("train")?;
        let val = read_split("val")?;
        let test = read_split("test")?;

        info!(
            path = %path.display(),
            train = train.len(),
            val = val.len(),
            test = test.len(),
            "Loaded dataset"
        );
        Self::from_splits(train, val, test, batch_size, seed)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl DataModule for ChestDataModule {
    fn train_batches(&self, epoch: usize) -> Box<dyn Iterator<Item = Batch> + Send + '_> {
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        Box::new(self.train.batches(self.batch_size, order))
    }

    fn val_batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_> {
        Box::new(self.val.batches(self.batch_size, (0..self.val.len()).collect()))
    }

    fn test_batches(&self) -> Box<dyn Iterator<Item = Batch> + Send + '_> {
        Box::new(self.test.batches(self.batch_size, (0..self.test.len()).collect()))
    }

    fn num_features(&self) -> usize {
        self.train.images.ncols()
    }

    fn num_classes(&self) -> usize {
        self.train.labels.ncols()
    }
}

fn read_member<R: std::io::Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<NpyArray, MlError> {
    let member = archive
        .by_name(&format!("{name}.npy"))
        .map_err(|e| MlError::dataset(format!("archive member {name}.npy: {e}")))?;
    read_npy(member)
}

/// `[n, h, w, ...]` -> `[n, h*w*...]`, u8 pixels scaled to `[0, 1]`.
fn images_to_matrix(arr: NpyArray) -> Result<Array2<f32>, MlError> {
    let rows = arr.shape.first().copied().unwrap_or(0);
    let cols: usize = arr.shape.iter().skip(1).product();
    let scale = if arr.dtype == NpyDtype::U8 { 1.0 / 255.0 } else { 1.0 };
    let data = arr.data.into_iter().map(|v| v * scale).collect();
    Array2::from_shape_vec((rows, cols), data)
        .map_err(|e| MlError::dataset(format!("image array: {e}")))
}

/// `[n]` or `[n, k]` labels -> `[n, k]`.
fn labels_to_matrix(arr: NpyArray) -> Result<Array2<f32>, MlError> {
    let rows = arr.shape.first().copied().unwrap_or(0);
    let cols: usize = arr.shape.iter().skip(1).product();
    Array2::from_shape_vec((rows, cols.max(1)), arr.data)
        .map_err(|e| MlError::dataset(format!("label array: {e}")))
}
