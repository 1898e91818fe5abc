//! Batch iteration over a [`SequenceWindowDataset`].

use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::dataset::SequenceWindowDataset;
use crate::error::Result;

/// A stacked batch of windows.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    /// `[B, k_in, C, H, W]`
    pub input: Tensor,
    /// `[B, k_out, C, H, W]`
    pub target: Tensor,
}

impl SequenceBatch {
    /// Number of sequences in the batch.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.input.dims()[0]
    }
}

/// Iterates a dataset in batches, in a fixed or shuffled order.
///
/// The last batch may be smaller than `batch_size`.
pub struct BatchLoader<'a> {
    dataset: &'a SequenceWindowDataset,
    order: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a> BatchLoader<'a> {
    /// Visit rows in index order.
    #[must_use]
    pub fn sequential(dataset: &'a SequenceWindowDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            order: (0..dataset.len()).collect(),
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    /// Visit rows in an order shuffled by `rng`.
    pub fn shuffled<R: Rng + ?Sized>(
        dataset: &'a SequenceWindowDataset,
        batch_size: usize,
        rng: &mut R,
    ) -> Self {
        let mut loader = Self::sequential(dataset, batch_size);
        loader.order.shuffle(rng);
        loader
    }

    /// Number of batches this loader yields in total.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    /// Row visiting order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    fn load_batch(&self, indices: &[usize]) -> Result<SequenceBatch> {
        let mut inputs = Vec::with_capacity(indices.len());
        let mut targets = Vec::with_capacity(indices.len());
        for &index in indices {
            let sample = self.dataset.get(index)?;
            inputs.push(sample.input);
            targets.push(sample.target);
        }
        Ok(SequenceBatch {
            input: Tensor::stack(&inputs, 0)?,
            target: Tensor::stack(&targets, 0)?,
        })
    }
}

impl Iterator for BatchLoader<'_> {
    type Item = Result<SequenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.load_batch(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}
