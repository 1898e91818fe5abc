//! Error types for convlstm-rs.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are never
//! translated into a different kind once raised; they propagate up to the run
//! boundary (the CLI `main`), which terminates with a diagnostic.
//!
//! # Example
//!
//! ```rust
//! use convlstm_rs::{ConvLstmError, Result};
//!
//! fn check_batch_size(batch_size: usize) -> Result<()> {
//!     if batch_size == 0 {
//!         return Err(ConvLstmError::Config("batch_size must be > 0".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(check_batch_size(0).is_err());
//! assert!(check_batch_size(8).is_ok());
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for convlstm-rs operations.
pub type Result<T> = std::result::Result<T, ConvLstmError>;

/// Errors that can occur while preparing data or training.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConvLstmError {
    /// Invalid configuration (window length, conflicting flags, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid YAML configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Malformed sequence metadata.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// CSV reader error.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    /// A frame tensor file is absent from the frame store.
    #[error("frame {frame_id} not found at {}", path.display())]
    FrameNotFound {
        /// Frame identifier that was requested.
        frame_id: i64,
        /// Path the store resolved it to.
        path: PathBuf,
    },

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl ConvLstmError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a dataset error.
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    /// Create a training error.
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Whether this error belongs to the configuration class and was raised
    /// before any training started.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_) | Self::ConfigParse(_))
    }

    /// Whether this error is an I/O failure (missing frame, unreadable file).
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::FrameNotFound { .. } | Self::Csv(_) | Self::Metadata(_)
        )
    }
}

impl From<indicatif::style::TemplateError> for ConvLstmError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ConvLstmError::Template(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_error_creation() {
        let error = ConvLstmError::config("k_in + k_out exceeds row length");
        assert_eq!(
            error.to_string(),
            "configuration error: k_in + k_out exceeds row length"
        );
        assert!(error.is_configuration());
        assert!(!error.is_io());
    }

    #[test]
    fn test_frame_not_found_display() {
        let error = ConvLstmError::FrameNotFound {
            frame_id: 42,
            path: PathBuf::from("/data/tensor_42.safetensors"),
        };
        let msg = error.to_string();
        assert!(msg.contains("frame 42"));
        assert!(msg.contains("tensor_42.safetensors"));
        assert!(error.is_io());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "metadata.csv not found");
        let error: ConvLstmError = io_error.into();
        assert!(error.to_string().contains("IO error"));
        assert!(error.is_io());
    }

    #[test]
    fn test_config_parse_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("a: b: :::").unwrap_err();
        let error: ConvLstmError = yaml_error.into();
        assert!(error.to_string().contains("invalid config file"));
        assert!(error.is_configuration());
    }

    #[test]
    fn test_candle_error_conversion() {
        use candle_core::{DType, Device, Tensor};

        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::zeros((3, 4), DType::F32, &Device::Cpu).unwrap();
        let candle_error = a.broadcast_add(&b).unwrap_err();
        let error: ConvLstmError = candle_error.into();
        assert!(error.to_string().contains("candle error"));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;

        let error: ConvLstmError = io::Error::new(io::ErrorKind::Other, "disk").into();
        assert!(error.source().is_some());
    }
}
