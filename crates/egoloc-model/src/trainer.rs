//! Training step orchestration and the continual task lifecycle.
//!
//! One [`Trainer::step`]:
//! 1. reject labels the current task has not introduced
//! 2. assign targets on the pyramid
//! 3. forward pass, detection loss plus continual penalty
//! 4. abort on a non-finite loss before touching any parameter or the loss
//!    normaliser
//! 5. backward, clip to the global L2 norm, optimizer update
//!
//! Epoch iteration, data loading and checkpointing belong to the caller.

use std::collections::BTreeSet;

use candle_core::backprop::GradStore;
use candle_core::{Device, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use egoloc_core::config::{OptimizerConfig, OptimizerType, RegularizerKind};
use egoloc_core::continual::{Exemplar, ReplayMemory, TaskSchedule};
use egoloc_core::schedule::LrSchedule;
use egoloc_core::{AssignedTargets, CoreResult, ExperimentConfig, LabelAssigner, NmsDecoder, Segment};

use crate::detector::Detector;
use crate::error::{ModelError, ModelResult};
use crate::input::PreparedBatch;
use crate::loss::{DetectionLoss, LossBreakdown};
use crate::regularizer::ContinualRegularizer;

// ============================================================================
// OPTIMIZER ADAPTER
// ============================================================================

/// The two optimizers selectable by `opt.type`.
pub enum OptimizerAdapter {
    AdamW(candle_nn::AdamW),
    /// Plain SGD; `opt.momentum` and `opt.weight_decay` are not applied.
    Sgd(candle_nn::SGD),
}

impl OptimizerAdapter {
    pub fn new(opt: &OptimizerConfig, vars: Vec<Var>) -> ModelResult<Self> {
        match opt.kind {
            OptimizerType::AdamW => {
                let params = ParamsAdamW {
                    lr: opt.learning_rate,
                    weight_decay: opt.weight_decay,
                    ..Default::default()
                };
                Ok(Self::AdamW(candle_nn::AdamW::new(vars, params)?))
            }
            OptimizerType::Sgd => Ok(Self::Sgd(candle_nn::SGD::new(vars, opt.learning_rate)?)),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(o) => o.set_learning_rate(lr),
            Self::Sgd(o) => o.set_learning_rate(lr),
        }
    }

    pub fn step(&mut self, grads: &GradStore) -> ModelResult<()> {
        match self {
            Self::AdamW(o) => o.step(grads)?,
            Self::Sgd(o) => o.step(grads)?,
        }
        Ok(())
    }
}

/// Global L2 norm of all parameter gradients.
fn grad_norm(vars: &[Var], grads: &GradStore) -> ModelResult<f32> {
    let mut sq = 0f32;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            sq += g.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    Ok(sq.sqrt())
}

/// Rescale every gradient so the global norm is at most `max_norm`.
fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, norm: f32, max_norm: f32) -> ModelResult<()> {
    if max_norm <= 0.0 || norm <= max_norm {
        return Ok(());
    }
    let scale = (max_norm / (norm + 1e-6)) as f64;
    for var in vars {
        let scaled = grads.get(var.as_tensor()).map(|g| g.affine(scale, 0.0)).transpose()?;
        if let Some(scaled) = scaled {
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(())
}

// ============================================================================
// TRAINER
// ============================================================================

/// Outcome of one optimizer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: usize,
    pub lr: f64,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
    pub snapshot_version: u64,
    pub loss: LossBreakdown,
}

pub struct Trainer {
    device: Device,
    varmap: VarMap,
    detector: Detector,
    optimizer: OptimizerAdapter,
    loss: DetectionLoss,
    regularizer: ContinualRegularizer,
    assigner: LabelAssigner,
    decoder: NmsDecoder,
    schedule: LrSchedule,
    tasks: Option<TaskSchedule>,
    replay: ReplayMemory,
    clip_grad_l2norm: f32,
    step: usize,
}

impl Trainer {
    /// Build the detector and optimizer state for `config`.
    ///
    /// `steps_per_epoch` sizes the learning-rate schedule.
    pub fn new(config: &ExperimentConfig, steps_per_epoch: usize, device: &Device) -> ModelResult<Self> {
        let varmap = VarMap::new();
        let detector = Detector::new(config, &varmap, device)?;
        let optimizer = OptimizerAdapter::new(&config.opt, varmap.all_vars())?;
        let assigner = LabelAssigner::new(
            detector.layout().clone(),
            &config.train_cfg,
            config.dataset.num_classes,
        );
        Ok(Self {
            device: device.clone(),
            varmap,
            detector,
            optimizer,
            loss: DetectionLoss::new(&config.train_cfg, config.dataset.num_classes),
            regularizer: ContinualRegularizer::new(&config.cl_cfg),
            assigner,
            decoder: NmsDecoder::new(&config.test_cfg, config.dataset.num_classes)?,
            schedule: LrSchedule::from_config(&config.opt, steps_per_epoch)?,
            tasks: None,
            replay: ReplayMemory::new(
                config.cl_cfg.memory_size,
                config.cl_cfg.type_sampling,
                config.init_rand_seed,
            ),
            clip_grad_l2norm: config.train_cfg.clip_grad_l2norm,
            step: 0,
        })
    }

    /// Attach a continual task order; batches are then checked against it.
    pub fn with_tasks(mut self, tasks: TaskSchedule) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn regularizer(&self) -> &ContinualRegularizer {
        &self.regularizer
    }

    pub fn tasks(&self) -> Option<&TaskSchedule> {
        self.tasks.as_ref()
    }

    pub fn loss(&self) -> &DetectionLoss {
        &self.loss
    }

    pub fn replay(&self) -> &ReplayMemory {
        &self.replay
    }

    /// Draw replay exemplars for the caller to mix into its next batch.
    pub fn draw_replay(&mut self, n: usize) -> Vec<Exemplar> {
        self.replay.draw(n)
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    /// Start the first task.
    pub fn begin_task(&mut self) -> ModelResult<()> {
        self.regularizer.begin_task(&self.varmap)?;
        if let Some(tasks) = &self.tasks {
            info!(
                task = tasks.current_index(),
                classes = tasks.current().classes.len(),
                "Started continual task"
            );
        }
        Ok(())
    }

    fn assign(&self, batch: &PreparedBatch) -> ModelResult<Vec<AssignedTargets>> {
        let targets = batch
            .ground_truth
            .iter()
            .map(|gts| self.assigner.assign(gts))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// One optimizer step on `batch`.
    ///
    /// # Errors
    ///
    /// - `TaskSequencing` before [`begin_task`](Self::begin_task), while a task
    ///   is being finalized, or when the batch references a class not
    ///   introduced yet
    /// - `NumericInstability` when the loss or gradient norm is not finite;
    ///   no parameter is updated in that case
    pub fn step(&mut self, batch: &PreparedBatch) -> ModelResult<StepReport> {
        self.regularizer.ensure_training()?;
        if let Some(tasks) = &self.tasks {
            tasks.validate_labels(batch.labels())?;
        }
        let targets = self.assign(batch)?;
        let snapshot = self.regularizer.snapshot();

        let output = self.detector.forward(batch, true)?;
        let penalty = self.regularizer.penalty(&self.varmap, &snapshot, &self.device)?;
        let loss = self.loss.compute(&output, &targets, &penalty)?;
        if !loss.breakdown.total.is_finite() {
            return Err(ModelError::numeric(format!(
                "total loss is {} at step {} (cls {}, reg {}, penalty {})",
                loss.breakdown.total, self.step, loss.breakdown.cls, loss.breakdown.reg, loss.breakdown.penalty
            )));
        }

        let vars = self.varmap.all_vars();
        let mut grads = loss.total.backward()?;
        let norm = grad_norm(&vars, &grads)?;
        if !norm.is_finite() {
            return Err(ModelError::numeric(format!("gradient norm is {norm} at step {}", self.step)));
        }
        clip_grad_norm(&vars, &mut grads, norm, self.clip_grad_l2norm)?;

        let lr = self.schedule.lr_at(self.step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        self.loss.commit(&loss.breakdown);

        let report = StepReport {
            step: self.step,
            lr,
            grad_norm: norm,
            snapshot_version: snapshot.version(),
            loss: loss.breakdown,
        };
        self.step += 1;
        info!(
            step = report.step,
            lr = report.lr,
            total = report.loss.total,
            cls = report.loss.cls,
            reg = report.loss.reg,
            penalty = report.loss.penalty,
            num_pos = report.loss.num_pos,
            grad_norm = report.grad_norm,
            "Training step"
        );
        Ok(report)
    }

    /// Close the current task.
    ///
    /// Accumulates parameter importance over `batches`, completes the task in
    /// the regularizer, refreshes the replay memory and advances the task
    /// order when another task follows.
    ///
    /// On error the regularizer returns to the active task with its previous
    /// snapshot; replay memory and the task order are untouched.
    pub fn finalize_task(&mut self, batches: &[PreparedBatch]) -> ModelResult<()> {
        self.regularizer.begin_finalize()?;
        let candidates = match self.accumulate_task(batches) {
            Ok(candidates) => candidates,
            Err(e) => {
                self.regularizer.abort_finalize()?;
                return Err(e);
            }
        };
        if let Err(e) = self.regularizer.complete_task(&self.varmap) {
            self.regularizer.abort_finalize()?;
            return Err(e);
        }

        let seen = match &self.tasks {
            Some(tasks) => tasks.seen_classes(),
            None => candidates.iter().map(|e| e.class_id).collect(),
        };
        self.replay.update(&seen, &candidates);

        if let Some(tasks) = self.tasks.as_mut() {
            if !tasks.is_last() {
                let next = tasks.advance()?;
                info!(task = next.index, classes = next.classes.len(), "Advanced to next continual task");
            }
        }
        debug!(replay = self.replay.len(), version = self.regularizer.version(), "Finalized task");
        Ok(())
    }

    /// Importance batches of a finalizing task; returns the replay candidates.
    fn accumulate_task(&mut self, batches: &[PreparedBatch]) -> ModelResult<Vec<Exemplar>> {
        let mut candidates = Vec::new();
        for batch in batches {
            let output = self.detector.forward(batch, false)?;
            let detection_loss = if self.regularizer.kind() == Some(RegularizerKind::Ewc) {
                let targets = self.assign(batch)?;
                let zero = candle_core::Tensor::zeros((), candle_core::DType::F32, &self.device)?;
                Some(self.loss.compute(&output, &targets, &zero)?.total)
            } else {
                None
            };
            if let Some(sensitivity) = self.regularizer.sensitivity(&output, detection_loss.as_ref())? {
                let grads = sensitivity.backward()?;
                self.regularizer.accumulate(&self.varmap, &grads)?;
            }

            if self.replay.is_enabled() {
                let embeddings = self.detector.pooled_embeddings(&output)?;
                for ((sample_id, gts), embedding) in batch.sample_ids.iter().zip(&batch.ground_truth).zip(embeddings) {
                    let classes: BTreeSet<usize> = gts.iter().map(|g| g.label).collect();
                    candidates.extend(classes.into_iter().map(|class_id| Exemplar {
                        sample_id: sample_id.clone(),
                        class_id,
                        embedding: embedding.clone(),
                    }));
                }
            }
        }
        Ok(candidates)
    }

    /// Ranked segments for every sample of `batch`.
    pub fn predict(&self, batch: &PreparedBatch) -> ModelResult<Vec<Vec<Segment>>> {
        self.detector.predict(batch, &self.decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::BatchBuilder;
    use crate::regularizer::RegularizerState;

    fn no_warmup_config() -> ExperimentConfig {
        let mut config = egoloc_test_utils::tiny_config();
        config.opt.warmup = false;
        config
    }

    fn batch(config: &ExperimentConfig, lengths: &[usize]) -> PreparedBatch {
        let device = Device::Cpu;
        let samples = crate::input::synthetic_samples(config, lengths, &device);
        BatchBuilder::new(config, &device).inference_batch(&samples).unwrap()
    }

    fn parameter_sum(trainer: &Trainer) -> f32 {
        trainer
            .varmap()
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().sum_all().unwrap().to_scalar::<f32>().unwrap())
            .sum()
    }

    #[test]
    fn test_step_updates_parameters() {
        let config = no_warmup_config();
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let b = batch(&config, &[48, 64]);
        let before = parameter_sum(&trainer);
        let report = trainer.step(&b).unwrap();
        assert!(report.loss.total.is_finite());
        assert!(report.lr > 0.0);
        assert_ne!(parameter_sum(&trainer), before);
        assert_eq!(trainer.current_step(), 1);
    }

    #[test]
    fn test_non_finite_loss_leaves_state_untouched() {
        let config = no_warmup_config();
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let b = batch(&config, &[40]);
        {
            let data = trainer.varmap().data().lock().unwrap();
            let bias = &data[&format!("heads.{}", crate::heads::CLS_BIAS_NAME)];
            bias.set(&bias.as_tensor().affine(0.0, f64::NAN).unwrap()).unwrap();
        }
        let before = parameter_sum(&trainer);
        let normalizer = trainer.loss().normalizer();
        let err = trainer.step(&b).unwrap_err();
        assert!(matches!(
            err.as_core(),
            Some(egoloc_core::CoreError::NumericInstability(_))
        ));
        // NaN sums compare unequal, so compare through the bit pattern
        assert_eq!(parameter_sum(&trainer).to_bits(), before.to_bits());
        assert_eq!(trainer.loss().normalizer(), normalizer);
        assert_eq!(trainer.current_step(), 0);
    }

    #[test]
    fn test_successful_step_commits_normalizer() {
        let config = no_warmup_config();
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let report = trainer.step(&batch(&config, &[48])).unwrap();
        assert_eq!(trainer.loss().normalizer(), report.loss.normalizer);
        assert_ne!(report.loss.normalizer, config.train_cfg.init_loss_norm);
    }

    #[test]
    fn test_step_requires_active_task() {
        let config = no_warmup_config();
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        let err = trainer.step(&batch(&config, &[48])).unwrap_err();
        assert!(matches!(err.as_core(), Some(egoloc_core::CoreError::TaskSequencing(_))));
        assert_eq!(trainer.current_step(), 0);
    }

    #[test]
    fn test_failed_finalize_rolls_back() {
        let mut config = no_warmup_config();
        config.cl_cfg.memory_size = 4;
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let good = batch(&config, &[48]);
        let mut bad = good.clone();
        let channels = bad.features.dim(1).unwrap();
        bad.features = bad.features.narrow(1, 0, channels - 1).unwrap();

        let err = trainer.finalize_task(&[good.clone(), bad]).unwrap_err();
        assert!(matches!(err.as_core(), Some(egoloc_core::CoreError::ShapeMismatch { .. })));
        assert_eq!(trainer.regularizer().state(), RegularizerState::TaskActive);
        assert_eq!(trainer.regularizer().version(), 0);
        assert!(trainer.replay().is_empty());

        trainer.step(&good).unwrap();
        trainer.finalize_task(std::slice::from_ref(&good)).unwrap();
        assert_eq!(trainer.regularizer().version(), 1);
        assert!(!trainer.replay().is_empty());
    }

    #[test]
    fn test_clip_grad_norm_scales_to_limit() {
        let device = Device::Cpu;
        let var = Var::new(&[3f32, 4.0], &device).unwrap();
        let mut grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let vars = vec![var];
        let norm = grad_norm(&vars, &grads).unwrap();
        assert!((norm - 10.0).abs() < 1e-4);
        clip_grad_norm(&vars, &mut grads, norm, 1.0).unwrap();
        assert!((grad_norm(&vars, &grads).unwrap() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_finalize_task_builds_importance() {
        let mut config = no_warmup_config();
        config.cl_cfg.memory_size = 4;
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let b = batch(&config, &[48, 64]);
        trainer.step(&b).unwrap();
        trainer.finalize_task(std::slice::from_ref(&b)).unwrap();
        assert_eq!(trainer.regularizer().state(), RegularizerState::TaskActive);
        assert_eq!(trainer.regularizer().version(), 1);
        assert!(trainer.regularizer().snapshot().total_importance().unwrap() > 0.0);
        assert!(!trainer.replay().is_empty());

        // the next step now carries a (zero, since nothing moved yet) penalty
        let report = trainer.step(&b).unwrap();
        assert_eq!(report.snapshot_version, 1);
        assert!(report.loss.penalty.abs() < 1e-6);
    }

    #[test]
    fn test_sgd_optimizer_steps() {
        let mut config = no_warmup_config();
        config.opt.kind = OptimizerType::Sgd;
        let mut trainer = Trainer::new(&config, 4, &Device::Cpu).unwrap();
        trainer.begin_task().unwrap();
        let b = batch(&config, &[64]);
        let before = parameter_sum(&trainer);
        trainer.step(&b).unwrap();
        assert_ne!(parameter_sum(&trainer), before);
    }
}
