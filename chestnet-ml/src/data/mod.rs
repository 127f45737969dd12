//! Data pipeline — npy decoding, dataset splits, minibatches.

pub mod batch;
pub mod datamodule;
pub mod npy;

pub use batch::{Batch, BatchOutput};
pub use datamodule::{ChestDataModule, DataModule, Split};
