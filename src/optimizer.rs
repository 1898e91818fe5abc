//! Adam optimizer used for every curriculum stage.

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{Optimizer, ParamsAdamW};

use crate::error::Result;

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1
    pub beta1: f64,
    /// Beta2
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamConfig {
    /// Config with the default betas and `learning_rate`.
    #[must_use]
    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    /// Build a fresh optimizer over `vars`, with empty moment estimates.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, vars: Vec<Var>) -> Result<AdamOptimizer> {
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        };

        let inner = candle_nn::AdamW::new(vars, params)?;

        Ok(AdamOptimizer { inner })
    }
}

/// Adam (AdamW with zero weight decay).
pub struct AdamOptimizer {
    inner: candle_nn::AdamW,
}

impl AdamOptimizer {
    /// Apply one update from precomputed gradients.
    ///
    /// # Errors
    ///
    /// Returns an error if the step fails.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner.step(grads)?;
        Ok(())
    }

    /// Current learning rate.
    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set the learning rate (used by the scheduler).
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn test_adam_config_default() {
        let config = AdamConfig::default();
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.beta1, 0.9);
        assert_eq!(config.beta2, 0.999);
    }

    #[test]
    fn test_step_moves_parameter_towards_minimum() -> Result<()> {
        let w = Var::from_tensor(&Tensor::new(&[2f32], &Device::Cpu)?)?;
        let mut opt = AdamConfig::with_learning_rate(0.1).build(vec![w.clone()])?;

        for _ in 0..5 {
            let loss = w.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step(&grads)?;
        }

        let value = w.as_tensor().to_vec1::<f32>()?[0];
        assert!(value < 2.0 && value > 1.0);
        Ok(())
    }

    #[test]
    fn test_set_learning_rate() -> Result<()> {
        let w = Var::zeros(3, DType::F32, &Device::Cpu)?;
        let mut opt = AdamConfig::default().build(vec![w])?;
        opt.set_learning_rate(5e-4);
        assert_eq!(opt.learning_rate(), 5e-4);
        Ok(())
    }
}
