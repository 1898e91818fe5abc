//! Curriculum bookkeeping: stage rebuilds, alpha schedule, unstable batches.

use std::cell::Cell;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use convlstm_rs::config::LossSelector;
use convlstm_rs::dataset::{DatasetFactory, SplitDatasetFactory, StageDatasets};
use convlstm_rs::frames::FrameStore;
use convlstm_rs::metadata::{SequenceIndexRow, SequenceMetadataTable};
use convlstm_rs::model::{ConvLstmModel, SequenceModel};
use convlstm_rs::{CurriculumTrainer, Result, TrainingConfig};

/// Frames are constant `[1, 8, 8]` tensors; nothing touches disk.
struct MemoryStore;

impl FrameStore for MemoryStore {
    fn load(&self, frame_id: i64) -> Result<Tensor> {
        let value = (frame_id % 7) as f64 / 7.0;
        Ok((Tensor::ones((1, 8, 8), DType::F32, &Device::Cpu)? * value)?)
    }
}

/// Records every sequence length it is asked for.
struct RecordingFactory {
    inner: SplitDatasetFactory,
    requested: Cell<Vec<usize>>,
}

impl RecordingFactory {
    fn new(sequences: i64, frames: i64) -> Self {
        let rows = (0..sequences)
            .map(|s| SequenceIndexRow {
                sequence: s,
                rain_category: 0.0,
                frames: (s * 100..s * 100 + frames).collect(),
            })
            .collect();
        let split = SequenceMetadataTable::new(rows).split(0.8, 1).unwrap();
        Self {
            inner: SplitDatasetFactory::new(split, Arc::new(MemoryStore)),
            requested: Cell::new(Vec::new()),
        }
    }

    fn requested(&self) -> Vec<usize> {
        let seen = self.requested.take();
        self.requested.set(seen.clone());
        seen
    }
}

impl DatasetFactory for RecordingFactory {
    fn check(&self, longest_seq_len: usize) -> Result<()> {
        self.inner.check(longest_seq_len)
    }

    fn make(&self, seq_len: usize) -> Result<StageDatasets> {
        let mut seen = self.requested.take();
        seen.push(seq_len);
        self.requested.set(seen);
        self.inner.make(seq_len)
    }
}

/// Wraps a real model but poisons every prediction with NaN.
struct NanModel(ConvLstmModel);

impl SequenceModel for NanModel {
    fn forward(
        &self,
        input: &Tensor,
        target: Option<&Tensor>,
        mask: &Tensor,
        sampling_enabled: bool,
    ) -> Result<Tensor> {
        let out = self.0.forward(input, target, mask, sampling_enabled)?;
        Ok((out * f64::NAN)?)
    }

    fn vars(&self) -> Vec<Var> {
        self.0.vars()
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.0.save(path)
    }
}

/// Adds `0 * sqrt(z)` with `z = 0` to every prediction: the loss stays
/// finite while the gradient reaching `z` is `0 / 0`.
struct NanGradientModel {
    inner: ConvLstmModel,
    z: Var,
}

impl NanGradientModel {
    fn new(inner: ConvLstmModel) -> Self {
        let z = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        Self { inner, z }
    }
}

impl SequenceModel for NanGradientModel {
    fn forward(
        &self,
        input: &Tensor,
        target: Option<&Tensor>,
        mask: &Tensor,
        sampling_enabled: bool,
    ) -> Result<Tensor> {
        let out = self.inner.forward(input, target, mask, sampling_enabled)?;
        let zero = (self.z.as_tensor().sqrt()? * 0.0)?;
        Ok(out.broadcast_add(&zero)?)
    }

    fn vars(&self) -> Vec<Var> {
        let mut vars = self.inner.vars();
        vars.push(self.z.clone());
        vars
    }

    fn save(&self, path: &Path) -> Result<()> {
        self.inner.save(path)
    }
}

fn snapshot(vars: &[Var]) -> Vec<Vec<f32>> {
    vars.iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}

fn three_stage_config() -> TrainingConfig {
    let mut config = TrainingConfig::tiny_preset();
    config.curriculum.start_seq_len = 2;
    config.curriculum.max_seq_len = 5;
    config
}

#[test]
fn test_each_stage_rebuilds_datasets_and_optimizer() {
    let config = three_stage_config();
    let factory = RecordingFactory::new(10, 10);

    let model = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    trainer.run(&factory).unwrap();

    assert_eq!(factory.requested(), vec![2, 3, 4]);
    assert_eq!(trainer.dataset_builds(), 3);
    assert_eq!(trainer.optimizer_resets(), 3);
}

#[test]
fn test_alpha_decrements_at_every_stage_start() {
    let config = three_stage_config();
    assert_eq!(config.training.loss, LossSelector::Hybrid);

    let model = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    let reports = trainer.run(&RecordingFactory::new(10, 10)).unwrap();

    let alphas: Vec<f64> = reports.iter().map(|r| r.alpha.unwrap()).collect();
    for (got, want) in alphas.iter().zip([0.95, 0.90, 0.85]) {
        assert!((got - want).abs() < 1e-9, "alpha {got} != {want}");
    }
    assert!((trainer.loss().alpha().unwrap() - 0.85).abs() < 1e-9);
}

#[test]
fn test_alpha_floors_at_zero() {
    let config = TrainingConfig::default();
    assert_eq!(config.curriculum.alpha_for_stage(19), 0.0);
    assert_eq!(config.curriculum.alpha_for_stage(40), 0.0);
    assert!(config.curriculum.alpha_for_stage(18) > 0.0);
}

#[test]
fn test_pixel_loss_has_no_alpha() {
    let mut config = three_stage_config();
    config.training.loss = LossSelector::Bce;

    let model = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    let reports = trainer.run(&RecordingFactory::new(10, 10)).unwrap();
    assert!(reports.iter().all(|r| r.alpha.is_none()));
}

#[test]
fn test_non_finite_loss_skips_update() {
    let mut config = TrainingConfig::tiny_preset();
    config.curriculum.max_seq_len = 3;
    config.training.batch_size = 3;

    let model = NanModel(ConvLstmModel::new(&config.model, &Device::Cpu).unwrap());
    let before = snapshot(&model.vars());

    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    let reports = trainer.run(&RecordingFactory::new(10, 6)).unwrap().to_vec();

    // 8 train sequences in batches of 3
    assert_eq!(reports[0].skipped_batches, 3);
    assert_eq!(reports[0].train_losses, vec![None]);
    assert_eq!(reports[0].val_losses, vec![None]);
    assert_eq!(snapshot(&trainer.model().vars()), before);
}

#[test]
fn test_non_finite_gradient_skips_update() {
    let mut config = TrainingConfig::tiny_preset();
    config.curriculum.max_seq_len = 3;
    config.training.batch_size = 3;
    config.training.loss = LossSelector::Mse;

    let model = NanGradientModel::new(ConvLstmModel::new(&config.model, &Device::Cpu).unwrap());
    let before = snapshot(&model.vars());

    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    let reports = trainer.run(&RecordingFactory::new(10, 6)).unwrap().to_vec();

    // the loss itself is finite, so only the gradient check can skip
    assert_eq!(reports[0].skipped_batches, 3);
    assert_eq!(reports[0].train_losses, vec![None]);
    assert!(reports[0].val_losses[0].is_some_and(f64::is_finite));
    assert_eq!(snapshot(&trainer.model().vars()), before);
}

#[test]
fn test_training_updates_parameters() {
    let mut config = TrainingConfig::tiny_preset();
    config.curriculum.max_seq_len = 3;

    let model = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    let before = snapshot(&model.vars());

    let mut trainer = CurriculumTrainer::new(&config, model, Device::Cpu).unwrap();
    trainer.run(&RecordingFactory::new(10, 6)).unwrap();
    assert_ne!(snapshot(&trainer.model().vars()), before);
}

#[test]
fn test_seeded_runs_are_reproducible() {
    let mut config = TrainingConfig::tiny_preset();
    config.curriculum.max_seq_len = 3;
    config.training.scheduled_sampling = true;
    config.training.loss = LossSelector::Mse;

    let model_a = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    let model_b = ConvLstmModel::new(&config.model, &Device::Cpu).unwrap();
    {
        let source = model_a.var_map().data().lock().unwrap();
        let dest = model_b.var_map().data().lock().unwrap();
        for (name, var) in source.iter() {
            dest[name].set(var.as_tensor()).unwrap();
        }
    }

    let mut trainer_a = CurriculumTrainer::new(&config, model_a, Device::Cpu).unwrap();
    let mut trainer_b = CurriculumTrainer::new(&config, model_b, Device::Cpu).unwrap();
    let a = trainer_a.run(&RecordingFactory::new(10, 6)).unwrap().to_vec();
    let b = trainer_b.run(&RecordingFactory::new(10, 6)).unwrap().to_vec();
    assert_eq!(trainer_a.mask_state().draws(), trainer_b.mask_state().draws());
    for (ra, rb) in a.iter().zip(&b) {
        for (la, lb) in ra.train_losses.iter().zip(&rb.train_losses) {
            assert!((la.unwrap() - lb.unwrap()).abs() < 1e-6);
        }
    }
}
