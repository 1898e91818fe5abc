//! Learning-rate scheduling.

use crate::optimizer::AdamOptimizer;

/// Step-decay scheduler: `lr = base_lr * gamma^steps`, stepped once per
/// epoch.
#[derive(Debug, Clone)]
pub struct StepDecay {
    base_lr: f64,
    gamma: f64,
    steps: usize,
}

impl StepDecay {
    /// Create a scheduler at step 0.
    #[must_use]
    pub fn new(base_lr: f64, gamma: f64) -> Self {
        Self {
            base_lr,
            gamma,
            steps: 0,
        }
    }

    /// Learning rate for the current step.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        let exp = i32::try_from(self.steps).unwrap_or(i32::MAX);
        self.base_lr * self.gamma.powi(exp)
    }

    /// Epochs elapsed.
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Step the scheduler and update optimizer.
    pub fn step(&mut self, optimizer: &mut AdamOptimizer) {
        self.steps += 1;
        optimizer.set_learning_rate(self.get_lr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::AdamConfig;
    use candle_core::{DType, Device, Var};

    #[test]
    fn test_decay_sequence() {
        let w = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut opt = AdamConfig::with_learning_rate(1e-2).build(vec![w]).unwrap();
        let mut scheduler = StepDecay::new(1e-2, 0.5);
        assert_eq!(scheduler.get_lr(), 1e-2);

        scheduler.step(&mut opt);
        assert!((opt.learning_rate() - 5e-3).abs() < 1e-12);
        scheduler.step(&mut opt);
        assert!((opt.learning_rate() - 2.5e-3).abs() < 1e-12);
        assert_eq!(scheduler.steps(), 2);
    }

    #[test]
    fn test_gamma_one_is_constant() {
        let mut scheduler = StepDecay::new(3e-4, 1.0);
        let w = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let mut opt = AdamConfig::with_learning_rate(3e-4).build(vec![w]).unwrap();
        for _ in 0..10 {
            scheduler.step(&mut opt);
        }
        assert_eq!(opt.learning_rate(), 3e-4);
    }
}
