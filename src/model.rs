//! ConvLSTM sequence-to-sequence model.
//!
//! The trainer only sees the [`SequenceModel`] trait; [`ConvLstmModel`] is
//! the stacked ConvLSTM implementation used by the CLI.

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Module, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::error::{ConvLstmError, Result};

/// Added to the forget-gate pre-activation.
const FORGET_BIAS: f64 = 1.0;
const NORM_EPS: f64 = 1e-5;

/// Model boundary consumed by the curriculum trainer.
pub trait SequenceModel {
    /// Predict `T_out` frames from `input` `[B, T_in, C, H, W]`.
    ///
    /// `mask` is `[B, T_out, C, H, W]`. With a `target` and
    /// `sampling_enabled`, the frame fed back before prediction `t` is
    /// `mask[:, t] * target[:, t-1] + (1 - mask[:, t]) * prediction[t-1]`;
    /// with a target and sampling disabled it is the ground truth; without a
    /// target it is the model's own prediction.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    fn forward(
        &self,
        input: &Tensor,
        target: Option<&Tensor>,
        mask: &Tensor,
        sampling_enabled: bool,
    ) -> Result<Tensor>;

    /// Trainable variables.
    fn vars(&self) -> Vec<Var>;

    /// Total number of trainable scalars.
    fn parameter_count(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Write every parameter to `path` (safetensors).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Layer normalization over `[C, H, W]` of each sample.
#[derive(Debug, Clone)]
struct GateNorm {
    weight: Tensor,
    bias: Tensor,
}

impl GateNorm {
    fn new(channels: usize, height: usize, width: usize, vb: VarBuilder) -> Result<Self> {
        let shape = (channels, height, width);
        Ok(Self {
            weight: vb.get_with_hints(shape, "weight", candle_nn::Init::Const(1.0))?,
            bias: vb.get_with_hints(shape, "bias", candle_nn::Init::Const(0.0))?,
        })
    }
}

impl Module for GateNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let dims = x.dims().to_vec();
        let flat = x.flatten_from(1)?;
        let mean = flat.mean_keepdim(1)?;
        let centered = flat.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(1)?;
        let normalized = centered.broadcast_div(&(var + NORM_EPS)?.sqrt()?)?;
        normalized
            .reshape(dims)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// One ConvLSTM cell.
#[derive(Debug, Clone)]
pub struct ConvLstmCell {
    conv_x: Conv2d,
    conv_h: Conv2d,
    norm_x: Option<GateNorm>,
    norm_h: Option<GateNorm>,
    hidden: usize,
}

impl ConvLstmCell {
    /// Create a cell mapping `in_channels` to `hidden` channels on a
    /// `height x width` grid.
    ///
    /// # Errors
    ///
    /// Returns an error if variables cannot be created.
    pub fn new(
        in_channels: usize,
        hidden: usize,
        config: &ModelConfig,
        [height, width]: [usize; 2],
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            padding: config.filter_size / 2,
            stride: config.stride,
            ..Default::default()
        };
        let k = config.filter_size;
        let conv_x = if config.bias {
            candle_nn::conv2d(in_channels, 4 * hidden, k, conv_cfg, vb.pp("conv_x"))?
        } else {
            candle_nn::conv2d_no_bias(in_channels, 4 * hidden, k, conv_cfg, vb.pp("conv_x"))?
        };
        let conv_h = candle_nn::conv2d_no_bias(hidden, 4 * hidden, k, conv_cfg, vb.pp("conv_h"))?;

        let (norm_x, norm_h) = if config.layer_norm {
            (
                Some(GateNorm::new(4 * hidden, height, width, vb.pp("norm_x"))?),
                Some(GateNorm::new(4 * hidden, height, width, vb.pp("norm_h"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            conv_x,
            conv_h,
            norm_x,
            norm_h,
            hidden,
        })
    }

    /// Hidden width.
    #[must_use]
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    /// Advance one step; returns the new `(h, c)`.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch.
    pub fn forward(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let mut gates_x = self.conv_x.forward(x)?;
        if let Some(norm) = &self.norm_x {
            gates_x = norm.forward(&gates_x)?;
        }
        let mut gates_h = self.conv_h.forward(h)?;
        if let Some(norm) = &self.norm_h {
            gates_h = norm.forward(&gates_h)?;
        }
        let gates = (gates_x + gates_h)?.chunk(4, 1)?;

        let i = candle_nn::ops::sigmoid(&gates[0])?;
        let f = candle_nn::ops::sigmoid(&(&gates[1] + FORGET_BIAS)?)?;
        let g = gates[2].tanh()?;
        let o = candle_nn::ops::sigmoid(&gates[3])?;

        let c_new = ((f * c)? + (i * g)?)?;
        let h_new = (o * c_new.tanh()?)?;
        Ok((h_new, c_new))
    }
}

/// Stacked ConvLSTM with a 1x1 output projection.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use convlstm_rs::model::{ConvLstmModel, SequenceModel};
/// use convlstm_rs::TrainingConfig;
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let config = TrainingConfig::tiny_preset();
/// let model = ConvLstmModel::new(&config.model, &Device::Cpu)?;
///
/// let input = Tensor::zeros((2, 3, 1, 8, 8), DType::F32, &Device::Cpu)?;
/// let mask = Tensor::ones((2, 4, 1, 8, 8), DType::F32, &Device::Cpu)?;
/// let prediction = model.forward(&input, None, &mask, false)?;
/// assert_eq!(prediction.dims(), &[2, 4, 1, 8, 8]);
/// assert_eq!(model.parameter_count(), ConvLstmModel::expected_parameter_count(&config.model));
/// # Ok(())
/// # }
/// ```
pub struct ConvLstmModel {
    cells: Vec<ConvLstmCell>,
    conv_last: Conv2d,
    config: ModelConfig,
    var_map: VarMap,
}

impl std::fmt::Debug for ConvLstmModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvLstmModel")
            .field("cells", &self.cells)
            .field("conv_last", &self.conv_last)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ConvLstmModel {
    /// Create a model with fresh random weights.
    ///
    /// # Errors
    ///
    /// Returns an error if variables cannot be created.
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(config, vb, var_map)
    }

    /// Load weights written by [`SequenceModel::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or does not match `config`.
    pub fn load(config: &ModelConfig, path: &Path, device: &Device) -> Result<Self> {
        if !path.is_file() {
            return Err(ConvLstmError::Checkpoint(format!(
                "no parameter file at {}",
                path.display()
            )));
        }
        let model = Self::new(config, device)?;
        let mut var_map = model.var_map.clone();
        var_map.load(path)?;
        Ok(model)
    }

    fn from_varbuilder(config: &ModelConfig, vb: VarBuilder, var_map: VarMap) -> Result<Self> {
        let in_channels = config.patch_channels();
        let grid = config.patch_frame_size();

        let mut cells = Vec::with_capacity(config.hidden.len());
        let mut prev = in_channels;
        for (i, &hidden) in config.hidden.iter().enumerate() {
            cells.push(ConvLstmCell::new(
                prev,
                hidden,
                config,
                grid,
                vb.pp(format!("cells.{i}")),
            )?);
            prev = hidden;
        }

        let conv_last = candle_nn::conv2d_no_bias(
            prev,
            in_channels,
            1,
            Conv2dConfig::default(),
            vb.pp("conv_last"),
        )?;

        Ok(Self {
            cells,
            conv_last,
            config: config.clone(),
            var_map,
        })
    }

    /// Parameter count implied by `config`, without building a model.
    #[must_use]
    pub fn expected_parameter_count(config: &ModelConfig) -> usize {
        let k2 = config.filter_size * config.filter_size;
        let [h, w] = config.patch_frame_size();
        let mut total = 0;
        let mut prev = config.patch_channels();
        for &hidden in &config.hidden {
            total += 4 * hidden * prev * k2;
            if config.bias {
                total += 4 * hidden;
            }
            total += 4 * hidden * hidden * k2;
            if config.layer_norm {
                total += 2 * 2 * 4 * hidden * h * w;
            }
            prev = hidden;
        }
        total + prev * config.patch_channels()
    }

    /// Architecture this model was built with.
    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Variable map holding every parameter.
    #[must_use]
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn zero_state(&self, batch: usize, device: &Device) -> Result<Vec<(Tensor, Tensor)>> {
        let [h, w] = self.config.patch_frame_size();
        self.cells
            .iter()
            .map(|cell| {
                let z = Tensor::zeros((batch, cell.hidden(), h, w), DType::F32, device)?;
                Ok((z.clone(), z))
            })
            .collect()
    }

    /// Feed one frame through the stack; returns the next-frame prediction.
    fn step(&self, frame: &Tensor, state: &mut [(Tensor, Tensor)]) -> Result<Tensor> {
        let mut x = frame.clone();
        for (cell, (h, c)) in self.cells.iter().zip(state.iter_mut()) {
            let (h_new, c_new) = cell.forward(&x, h, c)?;
            *h = h_new;
            *c = c_new;
            x = h.clone();
        }
        Ok(self.conv_last.forward(&x)?)
    }

    fn patchify(&self, t: &Tensor) -> Result<Tensor> {
        let p = self.config.patch_size;
        if p == 1 {
            return Ok(t.clone());
        }
        let (b, steps, c, h, w) = t.dims5()?;
        Ok(t.reshape((b * steps, c, h / p, p, w / p, p))?
            .permute((0, 1, 3, 5, 2, 4))?
            .reshape((b, steps, c * p * p, h / p, w / p))?)
    }

    fn unpatchify(&self, t: &Tensor) -> Result<Tensor> {
        let p = self.config.patch_size;
        if p == 1 {
            return Ok(t.clone());
        }
        let (b, steps, cp, hp, wp) = t.dims5()?;
        let c = cp / (p * p);
        Ok(t.reshape((b * steps, c, p, p, hp, wp))?
            .permute((0, 1, 4, 2, 5, 3))?
            .reshape((b, steps, c, hp * p, wp * p))?)
    }
}

impl SequenceModel for ConvLstmModel {
    fn forward(
        &self,
        input: &Tensor,
        target: Option<&Tensor>,
        mask: &Tensor,
        sampling_enabled: bool,
    ) -> Result<Tensor> {
        let (batch, t_in, _, _, _) = input.dims5()?;
        if t_in == 0 {
            return Err(ConvLstmError::training("input sequence is empty"));
        }
        let t_out = match target {
            Some(target) => target.dims()[1],
            None => mask.dims()[1],
        };
        if mask.dims()[0] != batch || mask.dims()[1] != t_out {
            return Err(ConvLstmError::training(format!(
                "mask shape {:?} does not cover {t_out} output steps for batch {batch}",
                mask.dims()
            )));
        }

        let input = self.patchify(input)?;
        let target = target.map(|t| self.patchify(t)).transpose()?;
        let mask = self.patchify(mask)?;
        let mut state = self.zero_state(batch, input.device())?;

        for t in 0..t_in - 1 {
            self.step(&input.get_on_dim(1, t)?, &mut state)?;
        }
        let mut prediction = self.step(&input.get_on_dim(1, t_in - 1)?, &mut state)?;

        let mut outputs = Vec::with_capacity(t_out);
        for t in 0..t_out {
            if t > 0 {
                let fed = match &target {
                    Some(target) => {
                        let truth = target.get_on_dim(1, t - 1)?;
                        if sampling_enabled {
                            let m = mask.get_on_dim(1, t)?;
                            (&prediction + (m * (truth - &prediction)?)?)?
                        } else {
                            truth
                        }
                    }
                    None => prediction.clone(),
                };
                prediction = self.step(&fed, &mut state)?;
            }
            outputs.push(prediction.clone());
        }

        let stacked = Tensor::stack(&outputs, 1)?;
        self.unpatchify(&stacked)
    }

    fn vars(&self) -> Vec<Var> {
        self.var_map.all_vars()
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }
}
