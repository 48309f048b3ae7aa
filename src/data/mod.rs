pub mod mnist;

pub use mnist::{DataLoader, MnistDataset, MNIST_CLASSES};

use crate::Tensor;

/// One feed: images `[N, 1, 28, 28]` and their class indices.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
