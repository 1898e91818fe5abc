//! Command-line overrides applied on top of a loaded [`TrainingConfig`].

use clap::Args;

use crate::config::{LossSelector, TrainingConfig};
use crate::error::{ConvLstmError, Result};

/// Run-id format used when none is configured.
pub const RUN_ID_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Flags that override individual config fields.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOverrides {
    /// Run identifier (default: UTC timestamp when the config leaves it empty)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output directory for the checkpoint
    #[arg(long)]
    pub output_dir: Option<String>,

    /// RNG seed for shuffling and masks
    #[arg(long)]
    pub seed: Option<u64>,

    /// Hidden widths of the ConvLSTM stack, e.g. 64,32,32,64
    #[arg(long, value_delimiter = ',')]
    pub hidden: Option<Vec<usize>>,

    /// Convolution filter size
    #[arg(long)]
    pub filter_size: Option<usize>,

    /// Convolution stride
    #[arg(long)]
    pub stride: Option<usize>,

    /// Patch size for space-to-depth folding
    #[arg(long)]
    pub patch_size: Option<usize>,

    /// Enable layer normalization in the cells
    #[arg(long)]
    pub layer_norm: bool,

    /// Disable the input-convolution bias
    #[arg(long)]
    pub no_bias: bool,

    /// Batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Epochs per curriculum stage
    #[arg(long)]
    pub epochs: Option<usize>,

    /// Loss selector: 0 = MSE, 1 = BCE, 2 = hybrid MSE/SSIM
    #[arg(long)]
    pub loss: Option<u8>,

    /// Learning rate
    #[arg(long)]
    pub lr: Option<f64>,

    /// Step-decay factor (requires the scheduler)
    #[arg(long)]
    pub gamma: Option<f64>,

    /// Enable the step-decay scheduler
    #[arg(long, conflicts_with = "no_scheduler")]
    pub scheduler: bool,

    /// Disable the step-decay scheduler
    #[arg(long)]
    pub no_scheduler: bool,

    /// Enable scheduled sampling
    #[arg(long)]
    pub scheduled_sampling: bool,

    /// Exclusive upper bound of the curriculum sequence length
    #[arg(long)]
    pub max_seq_len: Option<usize>,
}

impl ConfigOverrides {
    /// Apply the overrides to `config` and fill an empty run id.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for conflicting flags or an unknown
    /// loss selector.
    pub fn apply(&self, config: &mut TrainingConfig) -> Result<()> {
        if self.gamma.is_some() && self.no_scheduler {
            return Err(ConvLstmError::config(
                "--gamma has no effect with --no-scheduler",
            ));
        }

        if let Some(run_id) = &self.run_id {
            config.run_id.clone_from(run_id);
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir.clone_from(output_dir);
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }

        let model = &mut config.model;
        if let Some(hidden) = &self.hidden {
            model.hidden.clone_from(hidden);
        }
        if let Some(filter_size) = self.filter_size {
            model.filter_size = filter_size;
        }
        if let Some(stride) = self.stride {
            model.stride = stride;
        }
        if let Some(patch_size) = self.patch_size {
            model.patch_size = patch_size;
        }
        if self.layer_norm {
            model.layer_norm = true;
        }
        if self.no_bias {
            model.bias = false;
        }

        let training = &mut config.training;
        if let Some(batch_size) = self.batch_size {
            training.batch_size = batch_size;
        }
        if let Some(epochs) = self.epochs {
            training.epochs_per_stage = epochs;
        }
        if let Some(loss) = self.loss {
            training.loss = LossSelector::from_index(loss)?;
        }
        if let Some(lr) = self.lr {
            training.learning_rate = lr;
        }
        if let Some(gamma) = self.gamma {
            training.gamma = gamma;
            training.scheduler = true;
        }
        if self.scheduler {
            training.scheduler = true;
        }
        if self.no_scheduler {
            training.scheduler = false;
        }
        if self.scheduled_sampling {
            training.scheduled_sampling = true;
        }

        if let Some(max_seq_len) = self.max_seq_len {
            config.curriculum.max_seq_len = max_seq_len;
        }

        if config.run_id.is_empty() {
            config.run_id = chrono::Utc::now().format(RUN_ID_FORMAT).to_string();
        }
        Ok(())
    }
}
