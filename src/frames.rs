//! Frame tensor storage.
//!
//! Frames are addressed by integer id and resolved to `tensor_{id}.<ext>`
//! inside a directory. Every load hits storage; nothing is cached.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};

use crate::config::FrameFormat;
use crate::error::{ConvLstmError, Result};

/// Name looked up first inside a safetensors frame file.
pub const FRAME_TENSOR_NAME: &str = "frame";

/// Source of frame tensors.
pub trait FrameStore: Send + Sync {
    /// Load one frame as `[C, H, W]` F32.
    ///
    /// # Errors
    ///
    /// Must fail with [`ConvLstmError::FrameNotFound`] when the frame is
    /// absent; never substitutes a default frame.
    fn load(&self, frame_id: i64) -> Result<Tensor>;
}

/// Directory of `tensor_{frame_id}.<ext>` files.
#[derive(Debug, Clone)]
pub struct DirFrameStore {
    dir: PathBuf,
    format: FrameFormat,
    device: Device,
}

impl DirFrameStore {
    /// Create a store reading from `dir`, placing tensors on `device`.
    pub fn new(dir: impl Into<PathBuf>, format: FrameFormat, device: &Device) -> Self {
        Self {
            dir: dir.into(),
            format,
            device: device.clone(),
        }
    }

    /// Path a frame id resolves to.
    #[must_use]
    pub fn frame_path(&self, frame_id: i64) -> PathBuf {
        self.dir
            .join(format!("tensor_{frame_id}.{}", self.format.extension()))
    }

    /// Directory backing this store.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_tensor(&self, path: &Path) -> Result<Tensor> {
        match self.format {
            FrameFormat::Safetensors => {
                let mut tensors = candle_core::safetensors::load(path, &self.device)?;
                if let Some(t) = tensors.remove(FRAME_TENSOR_NAME) {
                    return Ok(t);
                }
                let count = tensors.len();
                if count == 1 {
                    if let Some((_, t)) = tensors.into_iter().next() {
                        return Ok(t);
                    }
                }
                Err(ConvLstmError::dataset(format!(
                    "{} holds {count} tensors and none is named `{FRAME_TENSOR_NAME}`",
                    path.display()
                )))
            }
            FrameFormat::Npy => Ok(Tensor::read_npy(path)?.to_device(&self.device)?),
        }
    }
}

impl FrameStore for DirFrameStore {
    fn load(&self, frame_id: i64) -> Result<Tensor> {
        let path = self.frame_path(frame_id);
        if !path.is_file() {
            return Err(ConvLstmError::FrameNotFound { frame_id, path });
        }
        let tensor = self.read_tensor(&path)?;
        to_chw(tensor, frame_id)
    }
}

/// Normalize a stored frame to `[C, H, W]` F32.
fn to_chw(tensor: Tensor, frame_id: i64) -> Result<Tensor> {
    let tensor = match tensor.rank() {
        2 => tensor.unsqueeze(0)?,
        3 => tensor,
        r => {
            return Err(ConvLstmError::dataset(format!(
                "frame {frame_id} has rank {r}, expected [H, W] or [C, H, W]"
            )))
        }
    };
    Ok(tensor.to_dtype(DType::F32)?)
}

/// Write a frame the way [`DirFrameStore`] reads it.
///
/// # Errors
///
/// Returns an error if the tensor cannot be serialized or written.
pub fn write_frame(dir: &Path, frame_id: i64, format: FrameFormat, frame: &Tensor) -> Result<PathBuf> {
    let path = dir.join(format!("tensor_{frame_id}.{}", format.extension()));
    match format {
        FrameFormat::Safetensors => frame.save_safetensors(FRAME_TENSOR_NAME, &path)?,
        FrameFormat::Npy => frame.write_npy(&path)?,
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_safetensors_frame_adds_channel_axis() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let frame = Tensor::arange(0f32, 16f32, &device)
            .unwrap()
            .reshape((4, 4))
            .unwrap();
        write_frame(temp_dir.path(), 3, FrameFormat::Safetensors, &frame).unwrap();

        let store = DirFrameStore::new(temp_dir.path(), FrameFormat::Safetensors, &device);
        let loaded = store.load(3).unwrap();
        assert_eq!(loaded.dims(), &[1, 4, 4]);
        assert_eq!(
            loaded.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            frame.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_load_npy_frame() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let frame = Tensor::ones((1, 2, 3), DType::F32, &device).unwrap();
        write_frame(temp_dir.path(), 11, FrameFormat::Npy, &frame).unwrap();

        let store = DirFrameStore::new(temp_dir.path(), FrameFormat::Npy, &device);
        assert_eq!(store.load(11).unwrap().dims(), &[1, 2, 3]);
    }

    #[test]
    fn test_missing_frame_fails_loudly() {
        let temp_dir = TempDir::new().unwrap();
        let store = DirFrameStore::new(temp_dir.path(), FrameFormat::Safetensors, &Device::Cpu);
        match store.load(99) {
            Err(ConvLstmError::FrameNotFound { frame_id, path }) => {
                assert_eq!(frame_id, 99);
                assert!(path.ends_with("tensor_99.safetensors"));
            }
            other => panic!("expected FrameNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_single_unnamed_tensor_is_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let frame = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        frame
            .save_safetensors("radar", temp_dir.path().join("tensor_5.safetensors"))
            .unwrap();

        let store = DirFrameStore::new(temp_dir.path(), FrameFormat::Safetensors, &device);
        assert_eq!(store.load(5).unwrap().dims(), &[1, 2, 2]);
    }

    #[test]
    fn test_ambiguous_safetensors_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let mut tensors = std::collections::HashMap::new();
        tensors.insert("a".to_string(), Tensor::ones((2, 2), DType::F32, &device).unwrap());
        tensors.insert("b".to_string(), Tensor::zeros((2, 2), DType::F32, &device).unwrap());
        candle_core::safetensors::save(&tensors, temp_dir.path().join("tensor_6.safetensors"))
            .unwrap();

        let store = DirFrameStore::new(temp_dir.path(), FrameFormat::Safetensors, &device);
        let err = store.load(6).unwrap_err();
        assert!(matches!(err, ConvLstmError::Dataset(_)));
        assert!(err.to_string().contains("2 tensors"));
    }

    #[test]
    fn test_frame_path_naming() {
        let store = DirFrameStore::new("/frames", FrameFormat::Npy, &Device::Cpu);
        assert_eq!(store.dir(), Path::new("/frames"));
        assert_eq!(store.frame_path(-4), PathBuf::from("/frames/tensor_-4.npy"));
    }
}
