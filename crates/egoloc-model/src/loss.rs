//! Detection loss.
//!
//! Components:
//! 1. Sigmoid focal classification loss (alpha 0.25, gamma 2) over valid positions
//! 2. Centre-DIoU regression loss over foreground positions
//! 3. Optional foreground segmentation BCE
//! 4. Optional InfoNCE between text and foreground positions
//! 5. Optional cosine alignment between text and pooled foreground features
//!
//! Classification, regression and segmentation are divided by a normaliser
//! that tracks the number of foreground positions as an exponential moving
//! average. [`DetectionLoss::compute`] only proposes the next normaliser; it
//! moves once the caller [`commit`](DetectionLoss::commit)s a finite step.

use candle_core::{DType, Device, Tensor, D};
use serde::{Deserialize, Serialize};
use tracing::trace;

use egoloc_core::config::TrainConfig;
use egoloc_core::AssignedTargets;

use crate::detector::DetectorOutput;
use crate::error::{ModelError, ModelResult};
use crate::ops;

const FOCAL_ALPHA: f64 = 0.25;
const EPS: f64 = 1e-8;
/// Floor of the regression loss when auto-balancing its weight.
const MIN_REG_FOR_BALANCE: f32 = 0.01;

/// Scalar values of every loss component for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub cls: f32,
    /// Unweighted regression loss.
    pub reg: f32,
    pub seg: f32,
    pub cont: f32,
    pub align: f32,
    pub penalty: f32,
    pub total: f32,
    pub normalizer: f32,
    pub num_pos: usize,
}

/// Differentiable total plus its breakdown.
#[derive(Debug)]
pub struct LossOutput {
    pub total: Tensor,
    pub breakdown: LossBreakdown,
}

/// Per-batch target tensors built from [`AssignedTargets`].
struct TargetTensors {
    /// `[B, P, C]`
    cls: Tensor,
    /// `[B, P]`, foreground restricted to valid positions.
    positive: Tensor,
    /// Flattened `b * P + p` indices of foreground positions.
    pos_index: Vec<u32>,
    /// `[num_pos, 2]`
    reg: Option<Tensor>,
}

impl TargetTensors {
    fn build(targets: &[AssignedTargets], valid: &[Vec<f32>], device: &Device) -> ModelResult<Self> {
        let b = targets.len();
        let p = targets.first().map(|t| t.num_positions()).unwrap_or(0);
        let c = targets.first().map(|t| t.num_classes).unwrap_or(0);
        let mut cls = Vec::with_capacity(b * p * c);
        let mut positive = Vec::with_capacity(b * p);
        let mut pos_index = Vec::new();
        let mut reg = Vec::new();
        for (i, (t, valid)) in targets.iter().zip(valid).enumerate() {
            if t.num_positions() != p {
                return Err(ModelError::shape("assigned positions", p, t.num_positions()));
            }
            cls.extend_from_slice(&t.cls);
            for (j, (&is_pos, &v)) in t.positive.iter().zip(valid).enumerate() {
                let fg = is_pos && v > 0.5;
                positive.push(if fg { 1f32 } else { 0.0 });
                if fg {
                    pos_index.push((i * p + j) as u32);
                    reg.extend_from_slice(&t.reg[j]);
                }
            }
        }
        let reg = if pos_index.is_empty() {
            None
        } else {
            Some(Tensor::from_vec(reg, (pos_index.len(), 2), device)?)
        };
        Ok(Self {
            cls: Tensor::from_vec(cls, (b, p, c), device)?,
            positive: Tensor::from_vec(positive, (b, p), device)?,
            pos_index,
            reg,
        })
    }

    fn num_pos(&self) -> usize {
        self.pos_index.len()
    }
}

/// 1-D centre-DIoU loss between `(left, right)` offset pairs, `[N]`.
pub fn ctr_diou_loss_1d(pred: &Tensor, target: &Tensor) -> ModelResult<Tensor> {
    let lp = pred.narrow(1, 0, 1)?.squeeze(1)?;
    let rp = pred.narrow(1, 1, 1)?.squeeze(1)?;
    let lg = target.narrow(1, 0, 1)?.squeeze(1)?;
    let rg = target.narrow(1, 1, 1)?.squeeze(1)?;

    let inter = lp.minimum(&lg)?.add(&rp.minimum(&rg)?)?;
    let union = lp.add(&rp)?.add(&lg)?.add(&rg)?.sub(&inter)?;
    let iou = inter.div(&union.maximum(EPS)?)?;

    let enclosing = lp.maximum(&lg)?.add(&rp.maximum(&rg)?)?;
    let rho = rp.sub(&lp)?.sub(&rg)?.add(&lg)?.affine(0.5, 0.0)?;
    let penalty = rho.sqr()?.div(&enclosing.sqr()?.maximum(EPS)?)?;
    Ok(iou.neg()?.affine(1.0, 1.0)?.add(&penalty)?)
}

/// Elementwise sigmoid focal loss with gamma 2.
fn sigmoid_focal_loss(logits: &Tensor, targets: &Tensor) -> ModelResult<Tensor> {
    let p = ops::sigmoid(logits)?;
    let ce = ops::bce_with_logits(logits, targets)?;
    // p_t = p*t + (1-p)*(1-t)
    let one_minus_p = p.neg()?.affine(1.0, 1.0)?;
    let one_minus_t = targets.neg()?.affine(1.0, 1.0)?;
    let p_t = p.mul(targets)?.add(&one_minus_p.mul(&one_minus_t)?)?;
    let modulating = p_t.neg()?.affine(1.0, 1.0)?.sqr()?;
    let alpha_t = targets.affine(2.0 * FOCAL_ALPHA - 1.0, 1.0 - FOCAL_ALPHA)?;
    Ok(ce.mul(&modulating)?.mul(&alpha_t)?)
}

/// Mean over `mask` rows of `[B, P, D]` features, falling back to `fallback`
/// for samples whose mask is empty.
fn pooled(features: &Tensor, mask: &Tensor, fallback: &Tensor) -> ModelResult<Tensor> {
    let counts: Vec<f32> = mask.sum(1)?.to_vec1()?;
    let mask = if counts.iter().any(|&c| c == 0.0) {
        let use_fallback: Vec<f32> = counts.iter().map(|&c| if c == 0.0 { 1.0 } else { 0.0 }).collect();
        let switch = Tensor::from_vec(use_fallback, (counts.len(), 1), mask.device())?;
        mask.add(&fallback.broadcast_mul(&switch)?)?
    } else {
        mask.clone()
    };
    let m = mask.unsqueeze(D::Minus1)?;
    let total = features.broadcast_mul(&m)?.sum(1)?;
    let count = m.sum(1)?.maximum(1.0)?;
    Ok(total.broadcast_div(&count)?)
}

/// Stateful loss: owns the foreground normaliser.
#[derive(Debug, Clone)]
pub struct DetectionLoss {
    normalizer: f32,
    momentum: f32,
    loss_weight: f32,
    label_smoothing: f32,
    seg_weight: f32,
    cont_weight: f32,
    align_weight: f32,
    temperature: f32,
    num_classes: usize,
}

impl DetectionLoss {
    pub fn new(train: &TrainConfig, num_classes: usize) -> Self {
        Self {
            normalizer: train.init_loss_norm,
            momentum: train.t_c_alpha,
            loss_weight: train.loss_weight,
            label_smoothing: train.label_smoothing,
            seg_weight: train.seg_loss_weight,
            cont_weight: train.cont_loss_weight,
            align_weight: train.al_loss_weight,
            temperature: train.temperature,
            num_classes,
        }
    }

    pub fn normalizer(&self) -> f32 {
        self.normalizer
    }

    /// Adopt the normaliser of a step that went through.
    pub fn commit(&mut self, breakdown: &LossBreakdown) {
        self.normalizer = breakdown.normalizer;
    }

    /// Compute the total loss of one batch.
    ///
    /// The breakdown's `normalizer` is the updated moving average used for this
    /// batch; the stored value is unchanged until [`commit`](Self::commit).
    ///
    /// `penalty` is the continual regularizer's scalar, added unweighted.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when targets and outputs disagree, `ConfigError` when an
    /// auxiliary loss is weighted but its inputs (text, head) are missing.
    pub fn compute(
        &self,
        output: &DetectorOutput,
        targets: &[AssignedTargets],
        penalty: &Tensor,
    ) -> ModelResult<LossOutput> {
        let logits = output.flat_cls_logits()?;
        let (b, p, c) = logits.dims3()?;
        if c != self.num_classes {
            return Err(ModelError::shape("classification logits", self.num_classes, c));
        }
        if targets.len() != b {
            return Err(ModelError::shape("assigned targets", b, targets.len()));
        }
        let device = logits.device().clone();
        let valid = output.flat_mask()?;
        let valid_rows: Vec<Vec<f32>> = valid.to_vec2()?;
        let tt = TargetTensors::build(targets, &valid_rows, &device)?;
        if tt.cls.dim(1)? != p {
            return Err(ModelError::shape("assigned positions", p, tt.cls.dim(1)?));
        }

        let num_pos = tt.num_pos();
        let normalizer = self.momentum * self.normalizer + (1.0 - self.momentum) * (num_pos.max(1) as f32);
        let norm = normalizer as f64;

        // classification
        let mut cls_targets = tt.cls.clone();
        if self.label_smoothing > 0.0 {
            let eps = self.label_smoothing as f64;
            cls_targets = cls_targets.affine(1.0 - eps, eps / (self.num_classes as f64 + 1.0))?;
        }
        let cls_loss = sigmoid_focal_loss(&logits, &cls_targets)?
            .broadcast_mul(&valid.unsqueeze(D::Minus1)?)?
            .sum_all()?
            .affine(1.0 / norm, 0.0)?;

        // regression
        let reg_loss = match &tt.reg {
            Some(reg_targets) => {
                let index = Tensor::from_vec(tt.pos_index.clone(), num_pos, &device)?;
                let pred = output.flat_offsets()?.reshape((b * p, 2))?.index_select(&index, 0)?;
                ctr_diou_loss_1d(&pred, reg_targets)?.sum_all()?.affine(1.0 / norm, 0.0)?
            }
            None => Tensor::zeros((), DType::F32, &device)?,
        };

        let cls_value = cls_loss.to_scalar::<f32>()?;
        let reg_value = reg_loss.to_scalar::<f32>()?;
        let reg_weight = if self.loss_weight > 0.0 {
            self.loss_weight
        } else {
            cls_value / reg_value.max(MIN_REG_FOR_BALANCE)
        };
        let mut total = cls_loss.add(&reg_loss.affine(reg_weight as f64, 0.0)?)?;
        let mut breakdown = LossBreakdown {
            cls: cls_value,
            reg: reg_value,
            normalizer,
            num_pos,
            ..Default::default()
        };

        if self.seg_weight > 0.0 {
            let seg_logits = output
                .flat_seg_logits()?
                .ok_or_else(|| ModelError::config("seg_loss_weight > 0 but the segmentation head is missing"))?;
            let seg = ops::bce_with_logits(&seg_logits, &tt.positive)?
                .mul(&valid)?
                .sum_all()?
                .affine(1.0 / norm, 0.0)?;
            breakdown.seg = seg.to_scalar()?;
            total = total.add(&seg.affine(self.seg_weight as f64, 0.0)?)?;
        }

        if self.cont_weight > 0.0 {
            let text = output
                .text_proj
                .as_ref()
                .ok_or_else(|| ModelError::config("cont_loss_weight > 0 requires text embeddings"))?;
            let feats = output
                .flat_contrastive()?
                .ok_or_else(|| ModelError::config("cont_loss_weight > 0 but the contrastive head is missing"))?;
            let cont = self.info_nce(&feats, text, &valid, &tt.positive, num_pos)?;
            breakdown.cont = cont.to_scalar()?;
            total = total.add(&cont.affine(self.cont_weight as f64, 0.0)?)?;
        }

        if self.align_weight > 0.0 {
            let text = output
                .text_proj
                .as_ref()
                .ok_or_else(|| ModelError::config("al_loss_weight > 0 requires text embeddings"))?;
            let video = pooled(&output.flat_features()?, &tt.positive, &valid)?;
            let cos = ops::l2_normalize(&video)?
                .mul(&ops::l2_normalize(text)?)?
                .sum(D::Minus1)?;
            let align = cos.neg()?.affine(1.0, 1.0)?.mean_all()?;
            breakdown.align = align.to_scalar()?;
            total = total.add(&align.affine(self.align_weight as f64, 0.0)?)?;
        }

        breakdown.penalty = penalty.to_scalar()?;
        let total = total.add(penalty)?;
        breakdown.total = total.to_scalar()?;
        trace!(?breakdown, "Computed detection loss");
        Ok(LossOutput { total, breakdown })
    }

    /// InfoNCE over positions: every foreground position is a positive for its
    /// sample's text against all valid positions of that sample.
    fn info_nce(
        &self,
        feats: &Tensor,
        text: &Tensor,
        valid: &Tensor,
        positive: &Tensor,
        num_pos: usize,
    ) -> ModelResult<Tensor> {
        let f = ops::l2_normalize(feats)?;
        let t = ops::l2_normalize(text)?.unsqueeze(1)?;
        // [B, P]; bounded by 1/temperature so exp is safe
        let sim = f.broadcast_mul(&t)?.sum(D::Minus1)?.affine(1.0 / self.temperature as f64, 0.0)?;
        let lse = sim.exp()?.mul(valid)?.sum_keepdim(1)?.maximum(EPS)?.log()?;
        let nll = lse.broadcast_sub(&sim)?.mul(positive)?.sum_all()?;
        Ok(nll.affine(1.0 / num_pos.max(1) as f64, 0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::Detector;
    use crate::input::BatchBuilder;
    use candle_nn::VarMap;
    use egoloc_core::{LabelAssigner, PyramidLayout};

    #[test]
    fn test_diou_perfect_and_offset() {
        let device = Device::Cpu;
        let target = Tensor::new(&[[2f32, 3.0], [1.0, 1.0]], &device).unwrap();
        let same = ctr_diou_loss_1d(&target, &target).unwrap().to_vec1::<f32>().unwrap();
        assert!(same.iter().all(|v| v.abs() < 1e-6));

        // pred [1,1] vs target [2,2]: iou 0.5, centres agree
        let pred = Tensor::new(&[[1f32, 1.0]], &device).unwrap();
        let tgt = Tensor::new(&[[2f32, 2.0]], &device).unwrap();
        let v = ctr_diou_loss_1d(&pred, &tgt).unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] - 0.5).abs() < 1e-6);

        // disjoint-centre case adds the distance penalty
        let pred = Tensor::new(&[[0f32, 2.0]], &device).unwrap();
        let tgt = Tensor::new(&[[2f32, 0.0]], &device).unwrap();
        let v = ctr_diou_loss_1d(&pred, &tgt).unwrap().to_vec1::<f32>().unwrap();
        // iou 0, rho 2, enclosing 4
        assert!((v[0] - 1.25).abs() < 1e-6);
    }

    #[test]
    fn test_focal_loss_confident_correct_is_small() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[8f32, -8.0, 0.0], &device).unwrap();
        let targets = Tensor::new(&[1f32, 0.0, 1.0], &device).unwrap();
        let v = sigmoid_focal_loss(&logits, &targets).unwrap().to_vec1::<f32>().unwrap();
        assert!(v[0] < 1e-6 && v[1] < 1e-6);
        // p = 0.5: 0.25 * 0.25 * ln 2
        assert!((v[2] - 0.25 * 0.25 * 2f32.ln()).abs() < 1e-5);
    }

    fn setup(config: &egoloc_core::ExperimentConfig) -> (Detector, crate::input::PreparedBatch, Vec<AssignedTargets>) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let detector = Detector::new(config, &varmap, &device).unwrap();
        let samples = crate::input::synthetic_samples(config, &[48, 64], &device);
        let batch = BatchBuilder::new(config, &device).inference_batch(&samples).unwrap();
        let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
        let assigner = LabelAssigner::new(layout, &config.train_cfg, config.dataset.num_classes);
        let targets = batch
            .ground_truth
            .iter()
            .map(|gts| assigner.assign(gts).unwrap())
            .collect();
        (detector, batch, targets)
    }

    #[test]
    fn test_zero_aux_weights_total_is_cls_plus_reg() {
        let config = egoloc_test_utils::tiny_config();
        let (detector, batch, targets) = setup(&config);
        let out = detector.forward(&batch, false).unwrap();
        let loss = DetectionLoss::new(&config.train_cfg, config.dataset.num_classes);
        let zero = Tensor::zeros((), DType::F32, &Device::Cpu).unwrap();
        let result = loss.compute(&out, &targets, &zero).unwrap();
        let b = &result.breakdown;
        assert!(b.num_pos > 0);
        assert!(b.reg > 0.0);
        assert!((b.total - (b.cls + b.reg)).abs() < 1e-4 * b.total.max(1.0));
        assert_eq!((b.seg, b.cont, b.align, b.penalty), (0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_normalizer_ema() {
        let config = egoloc_test_utils::tiny_config();
        let (detector, batch, targets) = setup(&config);
        let out = detector.forward(&batch, false).unwrap();
        let mut loss = DetectionLoss::new(&config.train_cfg, config.dataset.num_classes);
        let zero = Tensor::zeros((), DType::F32, &Device::Cpu).unwrap();
        let b = loss.compute(&out, &targets, &zero).unwrap().breakdown;
        let expected = 0.8 * 100.0 + 0.2 * b.num_pos as f32;
        assert!((b.normalizer - expected).abs() < 1e-3);
        assert_eq!(loss.normalizer(), 100.0);
        loss.commit(&b);
        assert!((loss.normalizer() - expected).abs() < 1e-3);
    }

    #[test]
    fn test_no_foreground_gives_zero_regression() {
        let config = egoloc_test_utils::tiny_config();
        let (detector, batch, _) = setup(&config);
        let out = detector.forward(&batch, false).unwrap();
        let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
        let assigner = LabelAssigner::new(layout, &config.train_cfg, config.dataset.num_classes);
        let empty = vec![assigner.assign(&[]).unwrap(); 2];
        let loss = DetectionLoss::new(&config.train_cfg, config.dataset.num_classes);
        let zero = Tensor::zeros((), DType::F32, &Device::Cpu).unwrap();
        let b = loss.compute(&out, &empty, &zero).unwrap().breakdown;
        assert_eq!(b.num_pos, 0);
        assert_eq!(b.reg, 0.0);
        assert!(b.cls > 0.0);
    }

    #[test]
    fn test_aux_losses_and_penalty_added() {
        let mut config = egoloc_test_utils::tiny_config();
        config.train_cfg.seg_loss_weight = 1.0;
        config.train_cfg.cont_loss_weight = 0.5;
        config.train_cfg.al_loss_weight = 0.5;
        let (detector, batch, targets) = setup(&config);
        let out = detector.forward(&batch, true).unwrap();
        let loss = DetectionLoss::new(&config.train_cfg, config.dataset.num_classes);
        let penalty = Tensor::new(0.25f32, &Device::Cpu).unwrap();
        let b = loss.compute(&out, &targets, &penalty).unwrap().breakdown;
        assert!(b.seg > 0.0 && b.cont > 0.0 && b.align >= 0.0);
        assert_eq!(b.penalty, 0.25);
        let expected = b.cls + b.reg + b.seg + 0.5 * b.cont + 0.5 * b.align + 0.25;
        assert!((b.total - expected).abs() < 1e-3 * expected.max(1.0));
    }

    #[test]
    fn test_weighted_aux_without_text_is_error() {
        let mut config = egoloc_test_utils::tiny_config();
        config.model.use_cross_modal = false;
        config.train_cfg.al_loss_weight = 1.0;
        let (detector, mut batch, targets) = setup(&config);
        batch.text = None;
        let out = detector.forward(&batch, false).unwrap();
        let loss = DetectionLoss::new(&config.train_cfg, config.dataset.num_classes);
        let zero = Tensor::zeros((), DType::F32, &Device::Cpu).unwrap();
        let err = loss.compute(&out, &targets, &zero).unwrap_err();
        assert!(err.to_string().contains("text"));
    }
}
