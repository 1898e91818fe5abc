//! Sequence metadata loading and the train/test split.
//!
//! The metadata CSV has one row per sequence window: a `sequence` (or
//! `seq_id`) column, a `rain_category` column, and every other column is a
//! frame identifier, in temporal order. An empty frame cell ends the row.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConvLstmError, Result};

const SEQUENCE_COLUMNS: [&str; 2] = ["sequence", "seq_id"];
const RAIN_COLUMN: &str = "rain_category";

/// One sequence window: ordered frame ids plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceIndexRow {
    /// Group id of the contiguous sequence this row belongs to.
    pub sequence: i64,
    /// Rain intensity label, used for split diagnostics only.
    pub rain_category: f64,
    /// Frame identifiers in temporal order.
    pub frames: Vec<i64>,
}

impl SequenceIndexRow {
    /// Number of frames available in this row.
    #[must_use]
    pub fn available_frames(&self) -> usize {
        self.frames.len()
    }
}

/// All metadata rows, partitioned by sequence id.
#[derive(Debug, Clone, Default)]
pub struct SequenceMetadataTable {
    rows: Vec<SequenceIndexRow>,
}

impl SequenceMetadataTable {
    /// Wrap already-parsed rows.
    #[must_use]
    pub fn new(rows: Vec<SequenceIndexRow>) -> Self {
        Self { rows }
    }

    /// Read the metadata CSV.
    ///
    /// # Errors
    ///
    /// Returns an I/O or CSV error if the file cannot be read, and a
    /// metadata error for missing columns or malformed frame cells.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = csv::Reader::from_path(path)?;
        let table = Self::from_reader(reader)?;
        tracing::info!(
            "Loaded {} metadata rows ({} sequences) from {}",
            table.len(),
            table.sequence_ids().len(),
            path.display()
        );
        Ok(table)
    }

    /// Parse metadata from any CSV reader.
    ///
    /// # Errors
    ///
    /// See [`SequenceMetadataTable::from_csv`].
    pub fn from_reader<R: std::io::Read>(mut reader: csv::Reader<R>) -> Result<Self> {
        let headers = reader.headers()?.clone();

        let sequence_col = headers
            .iter()
            .position(|h| SEQUENCE_COLUMNS.contains(&h.trim()))
            .ok_or_else(|| {
                ConvLstmError::Metadata("missing `sequence` (or `seq_id`) column".into())
            })?;
        let rain_col = headers.iter().position(|h| h.trim() == RAIN_COLUMN);
        let frame_cols: Vec<usize> = (0..headers.len())
            .filter(|&i| i != sequence_col && Some(i) != rain_col)
            .collect();
        if frame_cols.is_empty() {
            return Err(ConvLstmError::Metadata("no frame columns found".into()));
        }

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row_number = line + 2;

            let sequence = parse_integer(record.get(sequence_col).unwrap_or(""))
                .ok_or_else(|| {
                    ConvLstmError::Metadata(format!("row {row_number}: invalid sequence id"))
                })?;
            let rain_category = match rain_col.and_then(|c| record.get(c)) {
                Some(cell) if !cell.trim().is_empty() => {
                    cell.trim().parse::<f64>().map_err(|_| {
                        ConvLstmError::Metadata(format!(
                            "row {row_number}: invalid rain_category `{cell}`"
                        ))
                    })?
                }
                _ => 0.0,
            };

            let mut frames = Vec::with_capacity(frame_cols.len());
            let mut ended = false;
            for &col in &frame_cols {
                let cell = record.get(col).unwrap_or("").trim();
                if cell.is_empty() {
                    ended = true;
                    continue;
                }
                if ended {
                    return Err(ConvLstmError::Metadata(format!(
                        "row {row_number}: frame list is not contiguous (value after an empty cell)"
                    )));
                }
                let frame = parse_integer(cell).ok_or_else(|| {
                    ConvLstmError::Metadata(format!("row {row_number}: invalid frame id `{cell}`"))
                })?;
                frames.push(frame);
            }
            if frames.windows(2).any(|pair| pair[1] <= pair[0]) {
                return Err(ConvLstmError::Metadata(format!(
                    "row {row_number}: frame ids are not strictly increasing"
                )));
            }

            rows.push(SequenceIndexRow {
                sequence,
                rain_category,
                frames,
            });
        }

        Ok(Self::new(rows))
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows, in file order.
    #[must_use]
    pub fn rows(&self) -> &[SequenceIndexRow] {
        &self.rows
    }

    /// Distinct sequence ids, sorted.
    #[must_use]
    pub fn sequence_ids(&self) -> BTreeSet<i64> {
        self.rows.iter().map(|r| r.sequence).collect()
    }

    /// Rows grouped by sequence id.
    #[must_use]
    pub fn partition(&self) -> BTreeMap<i64, Vec<&SequenceIndexRow>> {
        let mut groups: BTreeMap<i64, Vec<&SequenceIndexRow>> = BTreeMap::new();
        for row in &self.rows {
            groups.entry(row.sequence).or_default().push(row);
        }
        groups
    }

    /// Rows whose sequence id is in `ids`, in file order.
    #[must_use]
    pub fn rows_for(&self, ids: &BTreeSet<i64>) -> Vec<SequenceIndexRow> {
        self.rows
            .iter()
            .filter(|r| ids.contains(&r.sequence))
            .cloned()
            .collect()
    }

    /// Split distinct sequence ids into train and test sets.
    ///
    /// `round(train_fraction * n)` ids are sampled uniformly without
    /// replacement from a `ChaCha8Rng` seeded with `seed`; the rest go to test.
    /// Sampling is over sequences, never individual rows, so no sequence
    /// straddles the boundary.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `train_fraction` is outside (0, 1).
    pub fn split(&self, train_fraction: f64, seed: u64) -> Result<TrainTestSplit> {
        if !(train_fraction > 0.0 && train_fraction < 1.0) {
            return Err(ConvLstmError::config(format!(
                "train_fraction must be in (0, 1), got {train_fraction}"
            )));
        }

        let ids: Vec<i64> = self.sequence_ids().into_iter().collect();
        let n_train = ((ids.len() as f64) * train_fraction).round() as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let picked = rand::seq::index::sample(&mut rng, ids.len(), n_train.min(ids.len()));

        let train: BTreeSet<i64> = picked.iter().map(|i| ids[i]).collect();
        let test: BTreeSet<i64> = ids.iter().copied().filter(|id| !train.contains(id)).collect();

        let split = TrainTestSplit {
            train_rows: self.rows_for(&train),
            test_rows: self.rows_for(&test),
            train_ids: train,
            test_ids: test,
        };
        split.log_summary();
        Ok(split)
    }
}

/// Parse an integer cell, accepting float spellings of integral values.
fn parse_integer(cell: &str) -> Option<i64> {
    let cell = cell.trim();
    if let Ok(v) = cell.parse::<i64>() {
        return Some(v);
    }
    let v = cell.parse::<f64>().ok()?;
    (v.is_finite() && v.fract() == 0.0).then_some(v as i64)
}

/// Partition of sequence ids into train and test.
#[derive(Debug, Clone)]
pub struct TrainTestSplit {
    /// Sequence ids in the train split.
    pub train_ids: BTreeSet<i64>,
    /// Sequence ids in the test split.
    pub test_ids: BTreeSet<i64>,
    /// Metadata rows belonging to train sequences.
    pub train_rows: Vec<SequenceIndexRow>,
    /// Metadata rows belonging to test sequences.
    pub test_rows: Vec<SequenceIndexRow>,
}

impl TrainTestSplit {
    /// Mean rain category of train and test rows (NaN for an empty side).
    #[must_use]
    pub fn mean_rain(&self) -> (f64, f64) {
        fn mean(rows: &[SequenceIndexRow]) -> f64 {
            if rows.is_empty() {
                return f64::NAN;
            }
            rows.iter().map(|r| r.rain_category).sum::<f64>() / rows.len() as f64
        }
        (mean(&self.train_rows), mean(&self.test_rows))
    }

    fn log_summary(&self) {
        let (train_rain, test_rain) = self.mean_rain();
        tracing::info!(
            "Split: {} train sequences ({} rows, mean rain {:.3}), {} test sequences ({} rows, mean rain {:.3})",
            self.train_ids.len(),
            self.train_rows.len(),
            train_rain,
            self.test_ids.len(),
            self.test_rows.len(),
            test_rain
        );
    }
}
