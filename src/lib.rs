//! # convlstm-rs
//!
//! Curriculum training for ConvLSTM precipitation nowcasting.
//!
//! A stacked ConvLSTM learns to forecast future radar frames from past
//! ones. Training runs over a curriculum of increasing sequence lengths;
//! at each stage the datasets, the Adam optimizer and the learning-rate
//! scheduler are rebuilt, a scheduled-sampling mask is thinned out, and
//! the weight of the structural (SSIM) term of the hybrid loss is lowered.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! convlstm init config.yaml --preset default
//!
//! # Check it, with overrides
//! convlstm validate config.yaml --hidden 64,32 --loss 2
//!
//! # Train
//! convlstm train config.yaml --scheduled-sampling --gamma 0.9
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use std::sync::Arc;
//! use convlstm_rs::dataset::SplitDatasetFactory;
//! use convlstm_rs::frames::DirFrameStore;
//! use convlstm_rs::metadata::SequenceMetadataTable;
//! use convlstm_rs::model::ConvLstmModel;
//! use convlstm_rs::{select_device, CurriculumTrainer, TrainingConfig};
//!
//! # fn main() -> convlstm_rs::Result<()> {
//! let config = TrainingConfig::from_file("config.yaml")?;
//! let device = select_device();
//!
//! let table = SequenceMetadataTable::from_csv(&config.data.metadata_csv)?;
//! let split = table.split(config.data.train_fraction, config.data.split_seed)?;
//! let store = Arc::new(DirFrameStore::new(&config.data.frame_dir, config.data.frame_format, &device));
//!
//! let model = ConvLstmModel::new(&config.model, &device)?;
//! let mut trainer = CurriculumTrainer::new(&config, model, device)?;
//! trainer.train(&SplitDatasetFactory::new(split, store))?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod device;
pub mod error;
pub mod frames;
pub mod loader;
pub mod loss;
pub mod metadata;
pub mod model;
pub mod optimizer;
pub mod sampling;
pub mod scheduler;
pub mod trainer;

pub use config::TrainingConfig;
pub use device::select_device;
pub use error::{ConvLstmError, Result};
pub use trainer::{CurriculumTrainer, StageReport};
