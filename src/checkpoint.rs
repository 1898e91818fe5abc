//! Final checkpoint: parameters, loss history and config snapshot.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::model::SequenceModel;
use crate::trainer::StageReport;

/// Loss history written next to the parameter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Run identifier
    pub run_id: String,
    /// Trainable scalars in the saved model
    pub parameter_count: usize,
    /// One report per curriculum stage, in order
    pub stages: Vec<StageReport>,
    /// RFC 3339 completion time
    pub completed_at: String,
}

impl TrainingHistory {
    /// History stamped with the current UTC time.
    #[must_use]
    pub fn new(run_id: impl Into<String>, parameter_count: usize, stages: Vec<StageReport>) -> Self {
        Self {
            run_id: run_id.into(),
            parameter_count,
            stages,
            completed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Read a history file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// File stem `convlstm_h{w1}-{w2}-…_{run_id}`.
#[must_use]
pub fn checkpoint_stem(config: &TrainingConfig) -> String {
    let widths = config
        .model
        .hidden
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("-");
    format!("convlstm_h{widths}_{}", config.run_id)
}

/// Paths of the three checkpoint files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Parameters (safetensors)
    pub model: PathBuf,
    /// Loss history (JSON)
    pub history: PathBuf,
    /// Config snapshot (YAML)
    pub config: PathBuf,
}

impl CheckpointPaths {
    /// Paths under `config.output_dir`.
    #[must_use]
    pub fn for_config(config: &TrainingConfig) -> Self {
        let dir = Path::new(&config.output_dir);
        let stem = checkpoint_stem(config);
        Self {
            model: dir.join(format!("{stem}.safetensors")),
            history: dir.join(format!("{stem}_history.json")),
            config: dir.join(format!("{stem}_config.yaml")),
        }
    }
}

/// Write the model, its history and the config that produced it.
///
/// # Errors
///
/// Returns an error if the output directory or any file cannot be written.
pub fn save_checkpoint<M: SequenceModel + ?Sized>(
    model: &M,
    config: &TrainingConfig,
    history: &TrainingHistory,
) -> Result<CheckpointPaths> {
    let paths = CheckpointPaths::for_config(config);
    std::fs::create_dir_all(&config.output_dir)?;

    model.save(&paths.model)?;

    let history_json = serde_json::to_string_pretty(history)?;
    std::fs::write(&paths.history, history_json)?;

    config.to_file(&paths.config)?;

    tracing::info!(
        "Saved checkpoint {} ({} parameters)",
        paths.model.display(),
        history.parameter_count
    );
    Ok(paths)
}
