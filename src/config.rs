//! Configuration parsing and validation.
//!
//! A [`TrainingConfig`] is built once (defaults, optionally a YAML file, then
//! CLI overrides), validated, and passed by reference into the trainer.

use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConvLstmError, Result};

/// Main configuration for a curriculum training run.
///
/// # Example
///
/// ```rust
/// use convlstm_rs::TrainingConfig;
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let mut config = TrainingConfig::from_preset("tiny")?;
/// config.training.epochs_per_stage = 2;
/// config.validate()?;
/// assert_eq!(config.stage_lengths(), 2..4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Run identifier, encoded into the checkpoint name.
    #[serde(default = "default_run_id")]
    pub run_id: String,

    /// Directory receiving the checkpoint and its sidecar files.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Seed for batch shuffling and scheduled-sampling masks.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Metadata and frame store settings.
    #[serde(default)]
    pub data: DataConfig,

    /// ConvLSTM architecture.
    #[serde(default)]
    pub model: ModelConfig,

    /// Optimization hyperparameters.
    #[serde(default)]
    pub training: OptimizationConfig,

    /// Sequence-length curriculum.
    #[serde(default)]
    pub curriculum: CurriculumConfig,
}

fn default_run_id() -> String {
    "baseline".into()
}

fn default_output_dir() -> String {
    "./models".into()
}

fn default_seed() -> u64 {
    42
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            run_id: default_run_id(),
            output_dir: default_output_dir(),
            seed: default_seed(),
            data: DataConfig::default(),
            model: ModelConfig::default(),
            training: OptimizationConfig::default(),
            curriculum: CurriculumConfig::default(),
        }
    }
}

/// On-disk encoding of frame tensors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameFormat {
    /// `tensor_{id}.safetensors`
    #[default]
    Safetensors,
    /// `tensor_{id}.npy`
    Npy,
}

impl FrameFormat {
    /// File extension without the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Safetensors => "safetensors",
            Self::Npy => "npy",
        }
    }
}

/// Sequence metadata and frame store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// CSV with one row per sequence window.
    #[serde(default = "default_metadata_csv")]
    pub metadata_csv: String,

    /// Directory holding `tensor_{frame_id}.<ext>` files.
    #[serde(default = "default_frame_dir")]
    pub frame_dir: String,

    /// Frame file encoding.
    #[serde(default)]
    pub frame_format: FrameFormat,

    /// Fraction of distinct sequences assigned to the train split.
    #[serde(default = "default_train_fraction")]
    pub train_fraction: f64,

    /// Seed for the train/test split.
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,
}

fn default_metadata_csv() -> String {
    "./data/id_seq_dataset.csv".into()
}
fn default_frame_dir() -> String {
    "./data/gray_tensor".into()
}
fn default_train_fraction() -> f64 {
    0.8
}
fn default_split_seed() -> u64 {
    1
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            metadata_csv: default_metadata_csv(),
            frame_dir: default_frame_dir(),
            frame_format: FrameFormat::default(),
            train_fraction: default_train_fraction(),
            split_seed: default_split_seed(),
        }
    }
}

/// ConvLSTM architecture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden channel width of each stacked cell.
    #[serde(default = "default_hidden")]
    pub hidden: Vec<usize>,

    /// Channels per frame on disk.
    #[serde(default = "default_channels")]
    pub channels: usize,

    /// Frame height and width on disk.
    #[serde(default = "default_frame_size")]
    pub frame_size: [usize; 2],

    /// Convolution kernel size (odd).
    #[serde(default = "default_filter_size")]
    pub filter_size: usize,

    /// Convolution stride.
    #[serde(default = "default_stride")]
    pub stride: usize,

    /// Patch size used to fold space into channels.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,

    /// Normalize gate pre-activations.
    #[serde(default)]
    pub layer_norm: bool,

    /// Use bias terms in the gate convolutions.
    #[serde(default = "default_true")]
    pub bias: bool,
}

fn default_hidden() -> Vec<usize> {
    vec![64, 32, 32, 64]
}
fn default_channels() -> usize {
    1
}
fn default_frame_size() -> [usize; 2] {
    [128, 128]
}
fn default_filter_size() -> usize {
    5
}
fn default_stride() -> usize {
    1
}
fn default_patch_size() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden: default_hidden(),
            channels: default_channels(),
            frame_size: default_frame_size(),
            filter_size: default_filter_size(),
            stride: default_stride(),
            patch_size: default_patch_size(),
            layer_norm: false,
            bias: true,
        }
    }
}

impl ModelConfig {
    /// Channels seen by the cells after patch folding.
    #[must_use]
    pub fn patch_channels(&self) -> usize {
        self.channels * self.patch_size * self.patch_size
    }

    /// Spatial size seen by the cells after patch folding.
    #[must_use]
    pub fn patch_frame_size(&self) -> [usize; 2] {
        let p = self.patch_size.max(1);
        [self.frame_size[0] / p, self.frame_size[1] / p]
    }
}

/// Pixel-error / loss selector (CLI `--loss 0|1|2`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossSelector {
    /// Mean squared error.
    Mse,
    /// Binary cross-entropy, sum reduction.
    Bce,
    /// Adaptive blend of MSE and structural dissimilarity.
    #[default]
    Hybrid,
}

impl LossSelector {
    /// Map the numeric CLI selector (0 = MSE, 1 = BCE, 2 = hybrid).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for any other value.
    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            0 => Ok(Self::Mse),
            1 => Ok(Self::Bce),
            2 => Ok(Self::Hybrid),
            other => Err(ConvLstmError::config(format!(
                "unknown loss selector {other} (expected 0=mse, 1=bce, 2=hybrid)"
            ))),
        }
    }
}

/// Optimization hyperparameters, shared by every curriculum stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationConfig {
    /// Sequences per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Epochs run inside each curriculum stage.
    #[serde(default = "default_epochs")]
    pub epochs_per_stage: usize,

    /// Adam learning rate at the start of every stage.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Step-decay factor applied once per epoch.
    #[serde(default = "default_gamma")]
    pub gamma: f64,

    /// Enable the step-decay scheduler.
    #[serde(default)]
    pub scheduler: bool,

    /// Loss function.
    #[serde(default)]
    pub loss: LossSelector,

    /// Enable scheduled sampling during training.
    #[serde(default)]
    pub scheduled_sampling: bool,

    /// Log progress every N batches.
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    /// Draw a progress bar while training.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_batch_size() -> usize {
    64
}
fn default_epochs() -> usize {
    10
}
fn default_lr() -> f64 {
    1e-3
}
fn default_gamma() -> f64 {
    0.9
}
fn default_log_every() -> usize {
    10
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs_per_stage: default_epochs(),
            learning_rate: default_lr(),
            gamma: default_gamma(),
            scheduler: false,
            loss: LossSelector::default(),
            scheduled_sampling: false,
            log_every: default_log_every(),
            show_progress: false,
        }
    }
}

/// Sequence-length curriculum and hybrid-loss alpha schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumConfig {
    /// First stage length (k_in = k_out = L).
    #[serde(default = "default_start_seq_len")]
    pub start_seq_len: usize,

    /// Exclusive upper bound on stage length; also the mask denominator.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Alpha before the first stage decrement.
    #[serde(default = "default_alpha_initial")]
    pub alpha_initial: f64,

    /// Alpha decrement applied at every stage start.
    #[serde(default = "default_alpha_step")]
    pub alpha_step: f64,
}

fn default_start_seq_len() -> usize {
    2
}
fn default_max_seq_len() -> usize {
    10
}
fn default_alpha_initial() -> f64 {
    1.0
}
fn default_alpha_step() -> f64 {
    0.05
}

impl Default for CurriculumConfig {
    fn default() -> Self {
        Self {
            start_seq_len: default_start_seq_len(),
            max_seq_len: default_max_seq_len(),
            alpha_initial: default_alpha_initial(),
            alpha_step: default_alpha_step(),
        }
    }
}

impl CurriculumConfig {
    /// Hybrid-loss alpha for the stage at `stage_index` (0-based).
    ///
    /// Alpha is decremented at every stage start, including the first, and
    /// floored at 0.
    #[must_use]
    pub fn alpha_for_stage(&self, stage_index: usize) -> f64 {
        let decrements = (stage_index + 1) as f64;
        (self.alpha_initial - self.alpha_step * decrements).clamp(0.0, 1.0)
    }
}

impl TrainingConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"default"` - 128x128 radar frames, four-layer ConvLSTM
    /// - `"tiny"` - 8x8 frames, one small cell; for smoke runs and tests
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown preset names.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "default" => Ok(Self::default()),
            "tiny" => Ok(Self::tiny_preset()),
            _ => Err(ConvLstmError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Small configuration that trains in well under a second on CPU.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            run_id: "tiny".into(),
            output_dir: "./outputs/tiny".into(),
            seed: default_seed(),
            data: DataConfig::default(),
            model: ModelConfig {
                hidden: vec![4],
                channels: 1,
                frame_size: [8, 8],
                filter_size: 3,
                stride: 1,
                patch_size: 1,
                layer_norm: false,
                bias: true,
            },
            training: OptimizationConfig {
                batch_size: 4,
                epochs_per_stage: 1,
                ..OptimizationConfig::default()
            },
            curriculum: CurriculumConfig {
                start_seq_len: 2,
                max_seq_len: 4,
                ..CurriculumConfig::default()
            },
        }
    }

    /// Sequence lengths visited by the curriculum, in order.
    #[must_use]
    pub fn stage_lengths(&self) -> Range<usize> {
        self.curriculum.start_seq_len..self.curriculum.max_seq_len
    }

    /// Validate the configuration before any training starts.
    ///
    /// # Errors
    ///
    /// Returns [`ConvLstmError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.run_id.is_empty() {
            return Err(ConvLstmError::config("run_id cannot be empty"));
        }
        if self.run_id.contains(['/', '\\']) {
            return Err(ConvLstmError::config(format!(
                "run_id cannot contain path separators: {}",
                self.run_id
            )));
        }
        if self.output_dir.is_empty() {
            return Err(ConvLstmError::config("output_dir cannot be empty"));
        }

        let data = &self.data;
        if !(data.train_fraction > 0.0 && data.train_fraction < 1.0) {
            return Err(ConvLstmError::config(format!(
                "train_fraction must be in (0, 1), got {}",
                data.train_fraction
            )));
        }

        let model = &self.model;
        if model.hidden.is_empty() || model.hidden.contains(&0) {
            return Err(ConvLstmError::config(
                "model.hidden must list at least one non-zero width",
            ));
        }
        if model.channels == 0 {
            return Err(ConvLstmError::config("model.channels must be > 0"));
        }
        if model.filter_size == 0 || model.filter_size % 2 == 0 {
            return Err(ConvLstmError::config(format!(
                "filter_size must be odd, got {}",
                model.filter_size
            )));
        }
        if model.stride != 1 {
            return Err(ConvLstmError::config(format!(
                "stride must be 1 so hidden states keep their spatial size, got {}",
                model.stride
            )));
        }
        if model.patch_size == 0 {
            return Err(ConvLstmError::config("patch_size must be > 0"));
        }
        let [h, w] = model.frame_size;
        if h == 0 || w == 0 || h % model.patch_size != 0 || w % model.patch_size != 0 {
            return Err(ConvLstmError::config(format!(
                "frame_size {h}x{w} must be non-empty and divisible by patch_size {}",
                model.patch_size
            )));
        }

        let training = &self.training;
        if training.batch_size == 0 {
            return Err(ConvLstmError::config("batch_size must be > 0"));
        }
        if training.epochs_per_stage == 0 {
            return Err(ConvLstmError::config("epochs_per_stage must be > 0"));
        }
        if !(training.learning_rate.is_finite() && training.learning_rate > 0.0) {
            return Err(ConvLstmError::config(format!(
                "learning_rate must be positive, got {}",
                training.learning_rate
            )));
        }
        if !(training.gamma > 0.0 && training.gamma <= 1.0) {
            return Err(ConvLstmError::config(format!(
                "gamma must be in (0, 1], got {}",
                training.gamma
            )));
        }
        if training.log_every == 0 {
            return Err(ConvLstmError::config("log_every must be > 0"));
        }

        let curriculum = &self.curriculum;
        if curriculum.start_seq_len < 2 {
            return Err(ConvLstmError::config(format!(
                "start_seq_len must be >= 2, got {}",
                curriculum.start_seq_len
            )));
        }
        if curriculum.start_seq_len >= curriculum.max_seq_len {
            return Err(ConvLstmError::config(format!(
                "start_seq_len ({}) must be below max_seq_len ({})",
                curriculum.start_seq_len, curriculum.max_seq_len
            )));
        }
        if !(0.0..=1.0).contains(&curriculum.alpha_initial) {
            return Err(ConvLstmError::config(format!(
                "alpha_initial must be in [0, 1], got {}",
                curriculum.alpha_initial
            )));
        }
        if !(curriculum.alpha_step.is_finite() && curriculum.alpha_step >= 0.0) {
            return Err(ConvLstmError::config(format!(
                "alpha_step must be >= 0, got {}",
                curriculum.alpha_step
            )));
        }

        Ok(())
    }
}
