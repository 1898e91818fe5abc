//! Windowed sequence datasets.
//!
//! A [`SequenceWindowDataset`] turns each metadata row into an input window
//! (the first `k_in` frames) and a target window (the next `k_out` frames).
//! Datasets are rebuilt for every curriculum stage through a
//! [`DatasetFactory`].

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::{ConvLstmError, Result};
use crate::frames::FrameStore;
use crate::metadata::{SequenceIndexRow, TrainTestSplit};

/// One `(input, target)` pair.
#[derive(Debug, Clone)]
pub struct WindowedSample {
    /// `[k_in, C, H, W]`
    pub input: Tensor,
    /// `[k_out, C, H, W]`
    pub target: Tensor,
}

/// Dataset of input/target frame windows over metadata rows.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use candle_core::Device;
/// use convlstm_rs::config::FrameFormat;
/// use convlstm_rs::dataset::SequenceWindowDataset;
/// use convlstm_rs::frames::DirFrameStore;
/// use convlstm_rs::metadata::SequenceMetadataTable;
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let table = SequenceMetadataTable::from_csv("data/id_seq_dataset.csv")?;
/// let store = Arc::new(DirFrameStore::new("data/gray_tensor", FrameFormat::Safetensors, &Device::Cpu));
/// let dataset = SequenceWindowDataset::new(table.rows().to_vec(), store, 5, 5)?;
/// let sample = dataset.get(0)?;
/// assert_eq!(sample.input.dims()[0], 5);
/// # Ok(())
/// # }
/// ```
pub struct SequenceWindowDataset {
    rows: Vec<SequenceIndexRow>,
    store: Arc<dyn FrameStore>,
    k_in: usize,
    k_out: usize,
}

impl std::fmt::Debug for SequenceWindowDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceWindowDataset")
            .field("rows", &self.rows.len())
            .field("k_in", &self.k_in)
            .field("k_out", &self.k_out)
            .finish_non_exhaustive()
    }
}

impl SequenceWindowDataset {
    /// Build a dataset, checking every row holds `k_in + k_out` frames.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a window length is zero or any row
    /// is too short, so that a bad stage fails before its first epoch.
    pub fn new(
        rows: Vec<SequenceIndexRow>,
        store: Arc<dyn FrameStore>,
        k_in: usize,
        k_out: usize,
    ) -> Result<Self> {
        if k_in == 0 || k_out == 0 {
            return Err(ConvLstmError::config(format!(
                "window lengths must be positive (k_in={k_in}, k_out={k_out})"
            )));
        }
        check_rows(&rows, k_in + k_out)?;

        Ok(Self {
            rows,
            store,
            k_in,
            k_out,
        })
    }

    /// Number of sequences available.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the dataset is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Input window length.
    #[must_use]
    pub fn k_in(&self) -> usize {
        self.k_in
    }

    /// Target window length.
    #[must_use]
    pub fn k_out(&self) -> usize {
        self.k_out
    }

    /// Load the windows for row `index`.
    ///
    /// # Errors
    ///
    /// Returns a dataset error for an out-of-range index and propagates
    /// frame loading failures unchanged.
    pub fn get(&self, index: usize) -> Result<WindowedSample> {
        let row = self.rows.get(index).ok_or_else(|| {
            ConvLstmError::dataset(format!(
                "index {index} out of range for dataset of {} rows",
                self.rows.len()
            ))
        })?;

        let input_ids = &row.frames[..self.k_in];
        let target_ids = &row.frames[self.k_in..self.k_in + self.k_out];

        Ok(WindowedSample {
            input: self.load_window(input_ids)?,
            target: self.load_window(target_ids)?,
        })
    }

    fn load_window(&self, frame_ids: &[i64]) -> Result<Tensor> {
        let frames = frame_ids
            .iter()
            .map(|&id| self.store.load(id))
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&frames, 0)?)
    }
}

/// Configuration error for the first row holding fewer than `needed` frames.
fn check_rows(rows: &[SequenceIndexRow], needed: usize) -> Result<()> {
    match rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.available_frames() < needed)
    {
        Some((index, row)) => Err(ConvLstmError::config(format!(
            "row {index} (sequence {}) has {} frames but k_in + k_out = {needed}",
            row.sequence,
            row.available_frames()
        ))),
        None => Ok(()),
    }
}

/// Train and test datasets for one curriculum stage.
#[derive(Debug)]
pub struct StageDatasets {
    /// Shuffled each epoch.
    pub train: SequenceWindowDataset,
    /// Visited in fixed order.
    pub test: SequenceWindowDataset,
}

/// Builds fresh datasets at every stage start.
pub trait DatasetFactory {
    /// Check that every row can serve windows of `longest_seq_len` on both
    /// sides. Called once before the first stage.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first row that is too short.
    fn check(&self, longest_seq_len: usize) -> Result<()>;

    /// Datasets with `k_in = k_out = seq_len`.
    ///
    /// # Errors
    ///
    /// Propagates dataset construction errors.
    fn make(&self, seq_len: usize) -> Result<StageDatasets>;
}

/// Factory over a fixed train/test split and frame store.
pub struct SplitDatasetFactory {
    split: TrainTestSplit,
    store: Arc<dyn FrameStore>,
}

impl SplitDatasetFactory {
    /// Create a factory.
    pub fn new(split: TrainTestSplit, store: Arc<dyn FrameStore>) -> Self {
        Self { split, store }
    }

    /// The split this factory draws rows from.
    #[must_use]
    pub fn split(&self) -> &TrainTestSplit {
        &self.split
    }
}

impl DatasetFactory for SplitDatasetFactory {
    fn check(&self, longest_seq_len: usize) -> Result<()> {
        let needed = 2 * longest_seq_len;
        check_rows(&self.split.train_rows, needed)?;
        check_rows(&self.split.test_rows, needed)
    }

    fn make(&self, seq_len: usize) -> Result<StageDatasets> {
        Ok(StageDatasets {
            train: SequenceWindowDataset::new(
                self.split.train_rows.clone(),
                Arc::clone(&self.store),
                seq_len,
                seq_len,
            )?,
            test: SequenceWindowDataset::new(
                self.split.test_rows.clone(),
                Arc::clone(&self.store),
                seq_len,
                seq_len,
            )?,
        })
    }
}
