//! Scheduled-sampling masks.
//!
//! A mask entry of 1 feeds the decoder the ground-truth previous frame at
//! that pixel; 0 feeds back the model's own prediction. The zeroed fraction
//! grows with the curriculum stage length.
//!
//! Masks are drawn fresh for every batch from the RNG held in a
//! [`MaskState`]; no mask is derived from, or aliases, a previous one.

use candle_core::{DType, Device, Shape, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;

/// RNG and statistics for mask draws, owned by the trainer.
#[derive(Debug, Clone)]
pub struct MaskState {
    rng: ChaCha8Rng,
    draws: usize,
    last_zeroed: usize,
}

impl MaskState {
    /// Seeded state; equal seeds reproduce the same sequence of masks.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            draws: 0,
            last_zeroed: 0,
        }
    }

    /// Masks drawn so far.
    #[must_use]
    pub fn draws(&self) -> usize {
        self.draws
    }

    /// Zeroed entries in the most recent mask.
    #[must_use]
    pub fn last_zeroed(&self) -> usize {
        self.last_zeroed
    }
}

/// Number of entries zeroed for a mask of `num_elements` at `stage_seq_len`.
///
/// `floor(num_elements * min(stage, max) / max)`; zero when `max_seq_len`
/// is zero.
#[must_use]
pub fn zeroed_count(num_elements: usize, stage_seq_len: usize, max_seq_len: usize) -> usize {
    if max_seq_len == 0 {
        return 0;
    }
    let stage = stage_seq_len.min(max_seq_len) as u128;
    ((num_elements as u128 * stage) / max_seq_len as u128) as usize
}

/// Build a 0/1 F32 mask of `shape` with `zeroed_count` zeros placed
/// uniformly at random without replacement.
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use convlstm_rs::sampling::{build, MaskState};
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let mut state = MaskState::new(0);
/// let mask = build(&mut state, 5, 10, (2, 5, 1, 4, 4), &Device::Cpu)?;
/// let ones = mask.sum_all()?.to_scalar::<f32>()?;
/// assert_eq!(ones, 80.0);
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if the tensor cannot be created on `device`.
pub fn build<S: Into<Shape>>(
    state: &mut MaskState,
    stage_seq_len: usize,
    max_seq_len: usize,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let n = shape.elem_count();
    let zeros = zeroed_count(n, stage_seq_len, max_seq_len);

    let mut values = vec![1f32; n];
    for index in rand::seq::index::sample(&mut state.rng, n, zeros).iter() {
        values[index] = 0.0;
    }

    state.draws += 1;
    state.last_zeroed = zeros;
    Ok(Tensor::from_vec(values, shape, device)?)
}

/// Mask used when scheduled sampling is disabled: full teacher forcing.
///
/// # Errors
///
/// Returns an error if the tensor cannot be created on `device`.
pub fn ones<S: Into<Shape>>(shape: S, device: &Device) -> Result<Tensor> {
    Ok(Tensor::ones(shape, DType::F32, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(mask: &Tensor) -> Vec<f32> {
        mask.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn count_zeros(mask: &Tensor) -> usize {
        values(mask).iter().filter(|&&v| v == 0.0).count()
    }

    #[test]
    fn test_stage_zero_is_all_ones() {
        let mut state = MaskState::new(1);
        let mask = build(&mut state, 0, 10, (3, 4, 1, 5, 5), &Device::Cpu).unwrap();
        assert_eq!(count_zeros(&mask), 0);
        assert_eq!(mask.dims(), &[3, 4, 1, 5, 5]);
    }

    #[test]
    fn test_stage_at_max_is_all_zeros() {
        let mut state = MaskState::new(1);
        let mask = build(&mut state, 10, 10, (2, 3, 1, 4, 4), &Device::Cpu).unwrap();
        assert_eq!(count_zeros(&mask), 96);

        let beyond = build(&mut state, 12, 10, (2, 3, 1, 4, 4), &Device::Cpu).unwrap();
        assert_eq!(count_zeros(&beyond), 96);
    }

    #[test]
    fn test_zeroed_count_floor_and_monotone() {
        assert_eq!(zeroed_count(10, 1, 3), 3);
        assert_eq!(zeroed_count(10, 2, 3), 6);
        assert_eq!(zeroed_count(7, 0, 3), 0);
        assert_eq!(zeroed_count(7, 5, 0), 0);

        let n = 1234;
        let counts: Vec<usize> = (0..=20).map(|s| zeroed_count(n, s, 20)).collect();
        assert!(counts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(counts[20], n);
    }

    #[test]
    fn test_mask_zero_fraction_matches_stage() {
        let mut state = MaskState::new(9);
        for stage in 0..=8 {
            let mask = build(&mut state, stage, 8, (4, 2, 1, 6, 6), &Device::Cpu).unwrap();
            assert_eq!(count_zeros(&mask), zeroed_count(288, stage, 8));
            assert_eq!(state.last_zeroed(), zeroed_count(288, stage, 8));
        }
        assert_eq!(state.draws(), 9);
    }

    #[test]
    fn test_masks_are_fresh_per_draw() {
        let mut state = MaskState::new(3);
        let a = build(&mut state, 5, 10, (1, 1, 1, 32, 32), &Device::Cpu).unwrap();
        let b = build(&mut state, 5, 10, (1, 1, 1, 32, 32), &Device::Cpu).unwrap();

        assert_eq!(count_zeros(&a), 512);
        assert_eq!(count_zeros(&b), 512);
        assert_ne!(values(&a), values(&b));
    }

    #[test]
    fn test_equal_seeds_reproduce_masks() {
        let mut s1 = MaskState::new(77);
        let mut s2 = MaskState::new(77);
        for stage in [2, 3, 4] {
            let a = build(&mut s1, stage, 6, (2, 2, 1, 3, 3), &Device::Cpu).unwrap();
            let b = build(&mut s2, stage, 6, (2, 2, 1, 3, 3), &Device::Cpu).unwrap();
            assert_eq!(values(&a), values(&b));
        }
    }

    #[test]
    fn test_ones_mask() {
        let mask = ones((2, 2), &Device::Cpu).unwrap();
        assert_eq!(values(&mask), vec![1.0; 4]);
    }
}
