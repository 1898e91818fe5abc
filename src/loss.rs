//! Pixel-error, structural-similarity and hybrid losses.
//!
//! `hybrid = (1 - alpha) * pixel + alpha * (1 - ssim)`, with alpha lowered
//! by the curriculum as sequences get longer.

use candle_core::{Device, Tensor};

use crate::config::LossSelector;
use crate::error::{ConvLstmError, Result};

const BCE_EPS: f64 = 1e-7;

/// Pixel-wise error term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelError {
    /// Mean squared error over all elements.
    Mse,
    /// Binary cross-entropy, summed over all elements.
    Bce,
}

impl PixelError {
    /// Compute the error between `prediction` and `target`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn compute(self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        check_same_shape(prediction, target)?;
        match self {
            Self::Mse => Ok(candle_nn::loss::mse(prediction, target)?),
            Self::Bce => {
                let p = prediction.clamp(BCE_EPS, 1.0 - BCE_EPS)?;
                let log_p = p.log()?;
                let log_not_p = p.affine(-1.0, 1.0)?.log()?;
                let not_t = target.affine(-1.0, 1.0)?;
                let ll = ((target * &log_p)? + (&not_t * &log_not_p)?)?;
                Ok(ll.sum_all()?.neg()?)
            }
        }
    }
}

/// Parameters of the Gaussian-windowed structural similarity index.
#[derive(Debug, Clone, Copy)]
pub struct SsimConfig {
    /// Window length along each spatial axis.
    pub window_size: usize,
    /// Gaussian standard deviation.
    pub sigma: f64,
    /// Luminance stabilizer coefficient.
    pub k1: f64,
    /// Contrast stabilizer coefficient.
    pub k2: f64,
    /// Dynamic range of pixel values.
    pub data_range: f64,
}

impl Default for SsimConfig {
    fn default() -> Self {
        Self {
            window_size: 11,
            sigma: 1.5,
            k1: 0.01,
            k2: 0.03,
            data_range: 1.0,
        }
    }
}

impl SsimConfig {
    /// Normalized 1-D Gaussian window.
    #[must_use]
    pub fn window(&self) -> Vec<f32> {
        let half = (self.window_size / 2) as f64;
        let raw: Vec<f64> = (0..self.window_size)
            .map(|i| {
                let d = i as f64 - half;
                (-(d * d) / (2.0 * self.sigma * self.sigma)).exp()
            })
            .collect();
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|v| (v / total) as f32).collect()
    }
}

/// Mean structural similarity of two `[N, C, H, W]` or `[B, T, C, H, W]`
/// tensors.
///
/// Sequence tensors are flattened to `[B*T, C, H, W]`; every channel of
/// every image is filtered independently. A spatial axis shorter than the
/// window is left unsmoothed.
///
/// # Errors
///
/// Returns an error if the shapes differ or the rank is not 4 or 5.
pub fn structural_similarity(x: &Tensor, y: &Tensor, config: &SsimConfig) -> Result<Tensor> {
    check_same_shape(x, y)?;
    let x = as_single_channel_images(x)?;
    let y = as_single_channel_images(y)?;

    let window = config.window();
    let c1 = (config.k1 * config.data_range).powi(2);
    let c2 = (config.k2 * config.data_range).powi(2);

    let mu1 = gaussian_filter(&x, &window)?;
    let mu2 = gaussian_filter(&y, &window)?;
    let mu1_sq = mu1.sqr()?;
    let mu2_sq = mu2.sqr()?;
    let mu1_mu2 = (&mu1 * &mu2)?;

    let sigma1_sq = (gaussian_filter(&x.sqr()?, &window)? - &mu1_sq)?;
    let sigma2_sq = (gaussian_filter(&y.sqr()?, &window)? - &mu2_sq)?;
    let sigma12 = (gaussian_filter(&(&x * &y)?, &window)? - &mu1_mu2)?;

    let cs_map = ((sigma12.affine(2.0, 0.0)? + c2)? / ((&sigma1_sq + &sigma2_sq)? + c2)?)?;
    let luminance = ((mu1_mu2.affine(2.0, 0.0)? + c1)? / ((&mu1_sq + &mu2_sq)? + c1)?)?;
    let ssim_map = (luminance * cs_map)?;

    Ok(ssim_map.mean_all()?)
}

/// Reshape to `[N*C, 1, H, W]`.
fn as_single_channel_images(t: &Tensor) -> Result<Tensor> {
    let t = match t.rank() {
        4 => t.clone(),
        5 => t.flatten(0, 1)?,
        r => {
            return Err(ConvLstmError::training(format!(
                "structural similarity expects rank 4 or 5 tensors, got rank {r}"
            )))
        }
    };
    let (n, c, h, w) = t.dims4()?;
    Ok(t.reshape((n * c, 1, h, w))?)
}

/// Separable valid Gaussian filtering along H then W.
fn gaussian_filter(x: &Tensor, window: &[f32]) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let k = window.len();
    let device: &Device = x.device();
    let mut out = x.clone();
    if h >= k {
        let kernel = Tensor::from_slice(window, (1, 1, k, 1), device)?.to_dtype(x.dtype())?;
        out = out.conv2d(&kernel, 0, 1, 1, 1)?;
    }
    if w >= k {
        let kernel = Tensor::from_slice(window, (1, 1, 1, k), device)?.to_dtype(x.dtype())?;
        out = out.conv2d(&kernel, 0, 1, 1, 1)?;
    }
    Ok(out)
}

fn check_same_shape(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(ConvLstmError::training(format!(
            "prediction shape {:?} does not match target shape {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

/// Blend of a pixel-error term and structural dissimilarity.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use convlstm_rs::loss::{HybridLoss, PixelError};
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let x = Tensor::rand(0f32, 1f32, (2, 3, 1, 16, 16), &Device::Cpu)?;
/// let mut loss = HybridLoss::new(0.5, PixelError::Mse);
/// let value = loss.compute(&x, &x)?.to_scalar::<f32>()?;
/// assert!(value.abs() < 1e-5);
///
/// loss.set_alpha(0.25);
/// assert_eq!(loss.alpha(), 0.25);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HybridLoss {
    alpha: f64,
    pixel: PixelError,
    ssim: SsimConfig,
}

impl HybridLoss {
    /// Create a hybrid loss; `alpha` is clamped to [0, 1].
    #[must_use]
    pub fn new(alpha: f64, pixel: PixelError) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            pixel,
            ssim: SsimConfig::default(),
        }
    }

    /// Current SSIM weight.
    #[must_use]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Set the SSIM weight, clamped to [0, 1].
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    /// Pixel term in use.
    #[must_use]
    pub fn pixel(&self) -> PixelError {
        self.pixel
    }

    /// Compute the blended loss as a scalar tensor.
    ///
    /// At alpha 0 only the pixel term is evaluated; at alpha 1 only the
    /// structural term is.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or unsupported rank.
    pub fn compute(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        if self.alpha <= 0.0 {
            return self.pixel.compute(prediction, target);
        }
        let dissimilarity =
            structural_similarity(prediction, target, &self.ssim)?.affine(-1.0, 1.0)?;
        if self.alpha >= 1.0 {
            return Ok(dissimilarity);
        }
        let pixel = self.pixel.compute(prediction, target)?;
        Ok((pixel.affine(1.0 - self.alpha, 0.0)? + dissimilarity.affine(self.alpha, 0.0)?)?)
    }
}

/// Loss selected once from configuration.
#[derive(Debug, Clone)]
pub enum LossFunction {
    /// Plain pixel error.
    Pixel(PixelError),
    /// Hybrid pixel/SSIM loss with a curriculum-driven alpha.
    Hybrid(HybridLoss),
}

impl LossFunction {
    /// Resolve the configured selector. The hybrid variant uses MSE as its
    /// pixel term and starts at `alpha`.
    #[must_use]
    pub fn from_selector(selector: LossSelector, alpha: f64) -> Self {
        match selector {
            LossSelector::Mse => Self::Pixel(PixelError::Mse),
            LossSelector::Bce => Self::Pixel(PixelError::Bce),
            LossSelector::Hybrid => Self::Hybrid(HybridLoss::new(alpha, PixelError::Mse)),
        }
    }

    /// Compute the loss.
    ///
    /// # Errors
    ///
    /// Propagates shape errors from the underlying term.
    pub fn compute(&self, prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            Self::Pixel(pixel) => pixel.compute(prediction, target),
            Self::Hybrid(hybrid) => hybrid.compute(prediction, target),
        }
    }

    /// Alpha of the hybrid variant.
    #[must_use]
    pub fn alpha(&self) -> Option<f64> {
        match self {
            Self::Pixel(_) => None,
            Self::Hybrid(hybrid) => Some(hybrid.alpha()),
        }
    }

    /// Update alpha; a no-op for pixel losses.
    pub fn set_alpha(&mut self, alpha: f64) {
        if let Self::Hybrid(hybrid) = self {
            hybrid.set_alpha(alpha);
        }
    }
}
