//! Curriculum training loop.
//!
//! Each stage trains at a fixed sequence length `L` (`k_in = k_out = L`),
//! with freshly built datasets, a fresh Adam optimizer and, optionally, a
//! step-decay scheduler. The hybrid loss alpha is lowered at the start of
//! every stage.

use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{save_checkpoint, CheckpointPaths, TrainingHistory};
use crate::config::TrainingConfig;
use crate::dataset::{DatasetFactory, SequenceWindowDataset};
use crate::device::device_name;
use crate::error::Result;
use crate::loader::{BatchLoader, SequenceBatch};
use crate::loss::LossFunction;
use crate::model::SequenceModel;
use crate::optimizer::{AdamConfig, AdamOptimizer};
use crate::sampling::{self, MaskState};
use crate::scheduler::StepDecay;

/// Summary of one curriculum stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Sequence length used for both windows
    pub seq_len: usize,
    /// Hybrid-loss alpha for the stage (`None` for pixel losses)
    pub alpha: Option<f64>,
    /// Learning rate at stage start
    pub lr_start: f64,
    /// Learning rate after the last epoch
    pub lr_end: f64,
    /// Mean training loss per epoch (`None` if every batch was skipped)
    pub train_losses: Vec<Option<f64>>,
    /// Mean validation loss per epoch (`None` for an empty test set)
    pub val_losses: Vec<Option<f64>>,
    /// Batches whose update was skipped for a non-finite loss or gradient
    pub skipped_batches: usize,
}

/// Metrics from a single training batch.
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    /// Loss value
    pub loss: f64,
    /// Global L2 norm of the gradients
    pub grad_norm: f64,
}

enum BatchOutcome {
    Updated(StepMetrics),
    Skipped,
}

/// Drives the curriculum over a [`SequenceModel`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use candle_core::Device;
/// use convlstm_rs::dataset::SplitDatasetFactory;
/// use convlstm_rs::frames::DirFrameStore;
/// use convlstm_rs::metadata::SequenceMetadataTable;
/// use convlstm_rs::model::ConvLstmModel;
/// use convlstm_rs::{CurriculumTrainer, TrainingConfig};
///
/// # fn main() -> convlstm_rs::Result<()> {
/// let config = TrainingConfig::from_file("config.yaml")?;
/// let device = Device::Cpu;
///
/// let table = SequenceMetadataTable::from_csv(&config.data.metadata_csv)?;
/// let split = table.split(config.data.train_fraction, config.data.split_seed)?;
/// let store = Arc::new(DirFrameStore::new(&config.data.frame_dir, config.data.frame_format, &device));
/// let factory = SplitDatasetFactory::new(split, store);
///
/// let model = ConvLstmModel::new(&config.model, &device)?;
/// let mut trainer = CurriculumTrainer::new(&config, model, device)?;
/// let paths = trainer.train(&factory)?;
/// println!("saved {}", paths.model.display());
/// # Ok(())
/// # }
/// ```
pub struct CurriculumTrainer<'a, M: SequenceModel> {
    config: &'a TrainingConfig,
    model: M,
    device: Device,
    loss: LossFunction,
    mask_state: MaskState,
    rng: ChaCha8Rng,
    dataset_builds: usize,
    optimizer_resets: usize,
    reports: Vec<StageReport>,
}

impl<'a, M: SequenceModel> CurriculumTrainer<'a, M> {
    /// Create a trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: &'a TrainingConfig, model: M, device: Device) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            model,
            device,
            loss: LossFunction::from_selector(config.training.loss, config.curriculum.alpha_initial),
            mask_state: MaskState::new(config.seed.wrapping_add(1)),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            dataset_builds: 0,
            optimizer_resets: 0,
            reports: Vec::new(),
        })
    }

    /// Run every stage, then save the final checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a dataset cannot be built, frames fail to load,
    /// or the checkpoint cannot be written.
    pub fn train<F: DatasetFactory + ?Sized>(&mut self, factory: &F) -> Result<CheckpointPaths> {
        self.run(factory)?;
        let history = TrainingHistory::new(
            &self.config.run_id,
            self.model.parameter_count(),
            self.reports.clone(),
        );
        save_checkpoint(&self.model, self.config, &history)
    }

    /// Run every stage without writing a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if a dataset cannot be built or frames fail to load.
    pub fn run<F: DatasetFactory + ?Sized>(&mut self, factory: &F) -> Result<&[StageReport]> {
        let stages = self.config.stage_lengths();
        if let Some(longest) = stages.clone().last() {
            factory.check(longest)?;
        }

        tracing::info!("Starting curriculum training");
        tracing::info!("  Run id: {}", self.config.run_id);
        tracing::info!("  Device: {}", device_name(&self.device));
        tracing::info!("  Stages: seq_len {}..{}", stages.start, stages.end);
        tracing::info!("  Epochs per stage: {}", self.config.training.epochs_per_stage);
        tracing::info!("  Parameters: {}", self.model.parameter_count());

        let started = Instant::now();
        self.reports.clear();
        for (stage_index, seq_len) in stages.enumerate() {
            let report = self.run_stage(stage_index, seq_len, factory)?;
            self.reports.push(report);
        }

        tracing::info!(
            "Training complete after {} stages in {:.1}s",
            self.reports.len(),
            started.elapsed().as_secs_f64()
        );
        Ok(&self.reports)
    }

    fn run_stage<F: DatasetFactory + ?Sized>(
        &mut self,
        stage_index: usize,
        seq_len: usize,
        factory: &F,
    ) -> Result<StageReport> {
        let config = self.config;
        let training = &config.training;

        let datasets = factory.make(seq_len)?;
        self.dataset_builds += 1;

        let mut optimizer =
            AdamConfig::with_learning_rate(training.learning_rate).build(self.model.vars())?;
        self.optimizer_resets += 1;
        let mut scheduler = training
            .scheduler
            .then(|| StepDecay::new(training.learning_rate, training.gamma));

        if matches!(self.loss, LossFunction::Hybrid(_)) {
            self.loss
                .set_alpha(config.curriculum.alpha_for_stage(stage_index));
        }

        tracing::info!(
            "Stage {} (seq_len {seq_len}): {} train / {} test sequences, alpha {:?}, lr {:.2e}",
            stage_index + 1,
            datasets.train.len(),
            datasets.test.len(),
            self.loss.alpha(),
            optimizer.learning_rate()
        );

        let mut report = StageReport {
            seq_len,
            alpha: self.loss.alpha(),
            lr_start: optimizer.learning_rate(),
            lr_end: optimizer.learning_rate(),
            train_losses: Vec::with_capacity(training.epochs_per_stage),
            val_losses: Vec::with_capacity(training.epochs_per_stage),
            skipped_batches: 0,
        };

        for epoch in 1..=training.epochs_per_stage {
            let (train_loss, skipped) =
                self.train_epoch(&datasets.train, &mut optimizer, seq_len, epoch)?;
            report.skipped_batches += skipped;

            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.step(&mut optimizer);
            }

            let val_loss = self.validate_epoch(&datasets.test)?;
            tracing::info!(
                "Stage {} epoch {epoch}/{}: train loss {}, val loss {}, lr {:.2e}",
                stage_index + 1,
                training.epochs_per_stage,
                format_loss(train_loss),
                format_loss(val_loss),
                optimizer.learning_rate()
            );

            report.train_losses.push(train_loss);
            report.val_losses.push(val_loss);
        }

        report.lr_end = optimizer.learning_rate();
        Ok(report)
    }

    /// One pass over the shuffled training set; returns the mean loss over
    /// updated batches and the number of skipped batches.
    fn train_epoch(
        &mut self,
        dataset: &SequenceWindowDataset,
        optimizer: &mut AdamOptimizer,
        seq_len: usize,
        epoch: usize,
    ) -> Result<(Option<f64>, usize)> {
        let loader = BatchLoader::shuffled(dataset, self.config.training.batch_size, &mut self.rng);
        let num_batches = loader.num_batches();
        let pb = self.progress_bar(num_batches)?;

        let mut total = 0.0;
        let mut updated = 0usize;
        let mut skipped = 0usize;

        for (batch_index, batch) in loader.enumerate() {
            let batch = batch?;
            match self.train_batch(&batch, optimizer, seq_len)? {
                BatchOutcome::Updated(metrics) => {
                    total += metrics.loss;
                    updated += 1;
                    pb.set_message(format!("{:.4}", metrics.loss));
                    tracing::debug!(
                        "Batch {}/{num_batches}: loss {:.6}, grad norm {:.4}",
                        batch_index + 1,
                        metrics.loss,
                        metrics.grad_norm
                    );
                }
                BatchOutcome::Skipped => skipped += 1,
            }
            pb.inc(1);

            if logs_batch(batch_index, self.config.training.log_every) {
                tracing::info!(
                    "Epoch {epoch}, batch {}/{num_batches}: running loss {}",
                    batch_index + 1,
                    format_loss((updated > 0).then(|| total / updated as f64))
                );
            }
        }
        pb.finish_and_clear();

        Ok(((updated > 0).then(|| total / updated as f64), skipped))
    }

    fn train_batch(
        &mut self,
        batch: &SequenceBatch,
        optimizer: &mut AdamOptimizer,
        seq_len: usize,
    ) -> Result<BatchOutcome> {
        let input = batch.input.to_device(&self.device)?;
        let target = batch.target.to_device(&self.device)?;

        let sampling_enabled = self.config.training.scheduled_sampling;
        let mask = if sampling_enabled {
            sampling::build(
                &mut self.mask_state,
                seq_len,
                self.config.curriculum.max_seq_len,
                target.shape().clone(),
                &self.device,
            )?
        } else {
            sampling::ones(target.shape().clone(), &self.device)?
        };

        let prediction = self
            .model
            .forward(&input, Some(&target), &mask, sampling_enabled)?;
        let loss = self.loss.compute(&prediction, &target)?;
        let loss_value = scalar(&loss)?;
        if !loss_value.is_finite() {
            tracing::warn!("Skipping batch: non-finite loss ({loss_value})");
            return Ok(BatchOutcome::Skipped);
        }

        let grads = loss.backward()?;
        let grad_norm = self.grad_norm(&grads)?;
        if !grad_norm.is_finite() {
            tracing::warn!("Skipping batch: non-finite gradient (loss {loss_value:.6})");
            return Ok(BatchOutcome::Skipped);
        }

        optimizer.step(&grads)?;
        Ok(BatchOutcome::Updated(StepMetrics {
            loss: loss_value,
            grad_norm,
        }))
    }

    /// Mean loss over the test set in fixed order, without updates.
    fn validate_epoch(&self, dataset: &SequenceWindowDataset) -> Result<Option<f64>> {
        let mut total = 0.0;
        let mut batches = 0usize;

        for batch in BatchLoader::sequential(dataset, self.config.training.batch_size) {
            let batch = batch?;
            let input = batch.input.to_device(&self.device)?;
            let target = batch.target.to_device(&self.device)?;
            let mask = sampling::ones(target.shape().clone(), &self.device)?;

            let prediction = self.model.forward(&input, Some(&target), &mask, false)?.detach();
            let value = scalar(&self.loss.compute(&prediction, &target)?)?;
            if value.is_finite() {
                total += value;
                batches += 1;
            } else {
                tracing::warn!("Non-finite validation loss ignored");
            }
        }

        Ok((batches > 0).then(|| total / batches as f64))
    }

    fn grad_norm(&self, grads: &GradStore) -> Result<f64> {
        let mut sum_sq = 0.0;
        for var in self.model.vars() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                sum_sq += scalar(&grad.sqr()?.sum_all()?)?;
            }
        }
        Ok(sum_sq.sqrt())
    }

    fn progress_bar(&self, len: usize) -> Result<ProgressBar> {
        if !self.config.training.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );
        Ok(pb)
    }

    /// Dataset factory calls so far (one per stage).
    #[must_use]
    pub fn dataset_builds(&self) -> usize {
        self.dataset_builds
    }

    /// Optimizers built so far (one per stage).
    #[must_use]
    pub fn optimizer_resets(&self) -> usize {
        self.optimizer_resets
    }

    /// Reports of completed stages.
    #[must_use]
    pub fn reports(&self) -> &[StageReport] {
        &self.reports
    }

    /// Current loss function.
    #[must_use]
    pub fn loss(&self) -> &LossFunction {
        &self.loss
    }

    /// Mask RNG state and draw statistics.
    #[must_use]
    pub fn mask_state(&self) -> &MaskState {
        &self.mask_state
    }

    /// The model being trained.
    #[must_use]
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Consume the trainer and return the model.
    pub fn into_model(self) -> M {
        self.model
    }
}

/// Progress is logged for the first batch and every `log_every`-th after it.
fn logs_batch(batch_index: usize, log_every: usize) -> bool {
    batch_index % log_every == 0
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

fn format_loss(loss: Option<f64>) -> String {
    loss.map_or_else(|| "n/a".to_string(), |l| format!("{l:.6}"))
}
