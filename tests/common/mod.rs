//! Synthetic datasets shared by the integration tests.

#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use convlstm_rs::config::FrameFormat;
use convlstm_rs::frames::write_frame;
use convlstm_rs::TrainingConfig;

/// Locations of a synthetic dataset on disk.
pub struct SyntheticData {
    pub metadata_csv: PathBuf,
    pub frame_dir: PathBuf,
}

/// Write `sequences` sequences of `frames_per_sequence` constant `[1, 8, 8]`
/// frames plus the metadata CSV under `root`.
pub fn write_dataset(
    root: &Path,
    sequences: i64,
    frames_per_sequence: i64,
    value: f32,
) -> SyntheticData {
    let frame_dir = root.join("frames");
    fs::create_dir_all(&frame_dir).expect("Failed to create frame dir");

    let frame = (Tensor::ones((1, 8, 8), DType::F32, &Device::Cpu).unwrap() * f64::from(value))
        .unwrap();

    let mut csv = String::from("sequence,rain_category");
    for i in 0..frames_per_sequence {
        write!(csv, ",frame_{i}").unwrap();
    }
    csv.push('\n');

    for s in 0..sequences {
        write!(csv, "{s},{}", s % 3).unwrap();
        for i in 0..frames_per_sequence {
            let id = s * 1000 + i;
            write_frame(&frame_dir, id, FrameFormat::Safetensors, &frame)
                .expect("Failed to write frame");
            write!(csv, ",{id}").unwrap();
        }
        csv.push('\n');
    }

    let metadata_csv = root.join("id_seq_dataset.csv");
    fs::write(&metadata_csv, csv).expect("Failed to write metadata");

    SyntheticData {
        metadata_csv,
        frame_dir,
    }
}

/// Tiny preset pointed at `data`, writing into `root/models`.
pub fn tiny_config(root: &Path, data: &SyntheticData) -> TrainingConfig {
    let mut config = TrainingConfig::tiny_preset();
    config.data.metadata_csv = data.metadata_csv.to_string_lossy().into_owned();
    config.data.frame_dir = data.frame_dir.to_string_lossy().into_owned();
    config.output_dir = root.join("models").to_string_lossy().into_owned();
    config
}
