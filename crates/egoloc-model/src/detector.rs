//! The full detector: backbone, neck, fusion and heads.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use egoloc_core::{ExperimentConfig, LevelPrediction, NmsDecoder, PyramidLayout, Segment};

use crate::backbone::{Backbone, Neck};
use crate::error::{ModelError, ModelResult};
use crate::fusion::CrossModalFusion;
use crate::heads::{self, DetectionHeads, LevelOutput, CLS_BIAS_NAME};
use crate::input::PreparedBatch;
use crate::ops;

/// Raw outputs of one forward pass.
#[derive(Debug, Clone)]
pub struct DetectorOutput {
    pub levels: Vec<LevelOutput>,
    /// `[B, 1, T_l]` per level.
    pub masks: Vec<Tensor>,
    /// Text-conditioned features per level, `[B, fpn_dim, T_l]`.
    pub fused: Vec<Tensor>,
    /// Contrastive projections per level, when that head exists.
    pub contrastive: Option<Vec<Tensor>>,
    /// `[B, fpn_dim]`, when the text projection exists and text was given.
    pub text_proj: Option<Tensor>,
}

/// Concatenate `[B, C, T_l]` tensors over levels into `[B, P, C]`.
fn flatten_levels<'a>(tensors: impl Iterator<Item = &'a Tensor>) -> ModelResult<Tensor> {
    let parts = tensors
        .map(|t| t.transpose(1, 2)?.contiguous())
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&parts, 1)?)
}

impl DetectorOutput {
    /// `[B, P, num_classes]` over all positions, level after level.
    pub fn flat_cls_logits(&self) -> ModelResult<Tensor> {
        flatten_levels(self.levels.iter().map(|l| &l.cls_logits))
    }

    /// `[B, P, 2]`
    pub fn flat_offsets(&self) -> ModelResult<Tensor> {
        flatten_levels(self.levels.iter().map(|l| &l.offsets))
    }

    /// `[B, P]`
    pub fn flat_mask(&self) -> ModelResult<Tensor> {
        Ok(flatten_levels(self.masks.iter())?.squeeze(D::Minus1)?)
    }

    /// `[B, P]`
    pub fn flat_seg_logits(&self) -> ModelResult<Option<Tensor>> {
        let segs: Option<Vec<&Tensor>> = self.levels.iter().map(|l| l.seg_logits.as_ref()).collect();
        match segs {
            Some(segs) => Ok(Some(flatten_levels(segs.into_iter())?.squeeze(D::Minus1)?)),
            None => Ok(None),
        }
    }

    /// `[B, P, fpn_dim]` fused features.
    pub fn flat_features(&self) -> ModelResult<Tensor> {
        flatten_levels(self.fused.iter())
    }

    /// `[B, P, fpn_dim]` contrastive projections.
    pub fn flat_contrastive(&self) -> ModelResult<Option<Tensor>> {
        self.contrastive
            .as_ref()
            .map(|levels| flatten_levels(levels.iter()))
            .transpose()
    }

    /// Squared L2 norm of every head output on valid positions, summed.
    pub fn output_energy(&self) -> ModelResult<Tensor> {
        let mut total: Option<Tensor> = None;
        for (level, mask) in self.levels.iter().zip(&self.masks) {
            let cls = level.cls_logits.broadcast_mul(mask)?.sqr()?.sum_all()?;
            let reg = level.offsets.broadcast_mul(mask)?.sqr()?.sum_all()?;
            let sum = cls.add(&reg)?;
            total = Some(match total {
                Some(t) => t.add(&sum)?,
                None => sum,
            });
        }
        total.ok_or_else(|| ModelError::config("detector produced no pyramid levels"))
    }
}

pub struct Detector {
    backbone: Backbone,
    neck: Neck,
    fusion: CrossModalFusion,
    heads: DetectionHeads,
    layout: PyramidLayout,
    num_classes: usize,
    input_dim: usize,
}

impl Detector {
    /// Build the network with parameters registered in `varmap`.
    pub fn new(config: &ExperimentConfig, varmap: &VarMap, device: &Device) -> ModelResult<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        let layout = PyramidLayout::from_config(&config.model, &config.dataset)?;
        let backbone = Backbone::new(
            &config.model,
            &config.train_cfg,
            config.dataset.input_dim,
            config.dataset.max_seq_len,
            vb.pp("backbone"),
            device,
        )?;
        let neck = Neck::new(&config.model, vb.pp("neck"))?;
        let fusion = CrossModalFusion::new(&config.model, vb.pp("fusion"))?;
        let heads = DetectionHeads::new(
            &config.model,
            &config.train_cfg,
            config.dataset.num_classes,
            vb.pp("heads"),
        )?;

        if !config.train_cfg.head_empty_cls.is_empty() {
            Self::bias_empty_classes(config, varmap, device)?;
        }

        let num_params: usize = varmap.all_vars().iter().map(|v| v.as_tensor().elem_count()).sum();
        info!(
            levels = layout.num_levels(),
            positions = layout.total_positions(),
            num_params,
            cross_modal = fusion.is_enabled(),
            "Built detector"
        );
        Ok(Self {
            backbone,
            neck,
            fusion,
            heads,
            layout,
            num_classes: config.dataset.num_classes,
            input_dim: config.dataset.input_dim,
        })
    }

    /// Push the classification bias of classes without data toward zero output.
    fn bias_empty_classes(config: &ExperimentConfig, varmap: &VarMap, device: &Device) -> ModelResult<()> {
        let prior = heads::prior_bias(config.train_cfg.cls_prior_prob as f64) as f32;
        let empty = heads::empty_class_bias() as f32;
        let values: Vec<f32> = (0..config.dataset.num_classes)
            .map(|c| {
                if config.train_cfg.head_empty_cls.contains(&c) {
                    empty
                } else {
                    prior
                }
            })
            .collect();
        let bias = Tensor::from_vec(values, config.dataset.num_classes, device)?;
        let name = format!("heads.{CLS_BIAS_NAME}");
        let data = varmap
            .data()
            .lock()
            .map_err(|e| ModelError::LockPoisoned(e.to_string()))?;
        let var = data
            .get(&name)
            .ok_or_else(|| ModelError::config(format!("parameter {name} not found")))?;
        var.set(&bias)?;
        debug!(classes = ?config.train_cfg.head_empty_cls, "Biased empty classes");
        Ok(())
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, batch: &PreparedBatch, train: bool) -> ModelResult<DetectorOutput> {
        let (_, channels, len) = batch.features.dims3()?;
        if channels != self.input_dim {
            return Err(ModelError::shape("feature channels", self.input_dim, channels));
        }
        if len != self.layout.seq_len() {
            return Err(ModelError::shape("padded sequence length", self.layout.seq_len(), len));
        }

        let pyramid = self.backbone.forward(&batch.features, &batch.mask, train)?;
        let pyramid = self.neck.forward(&pyramid)?;
        let fused = self
            .fusion
            .forward(&pyramid.feats, &pyramid.masks, batch.text.as_ref())?;

        let levels = fused
            .iter()
            .zip(&pyramid.masks)
            .enumerate()
            .map(|(l, (x, mask))| self.heads.forward_level(l, x, mask))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let contrastive = fused
            .iter()
            .map(|x| self.heads.contrastive_projection(x))
            .collect::<candle_core::Result<Option<Vec<_>>>>()?;
        let text_proj = match &batch.text {
            Some(text) => self.heads.text_projection(text)?,
            None => None,
        };
        Ok(DetectorOutput {
            levels,
            masks: pyramid.masks,
            fused,
            contrastive,
            text_proj,
        })
    }

    /// Inference: forward pass, then NMS decoding per sample.
    pub fn predict(&self, batch: &PreparedBatch, decoder: &NmsDecoder) -> ModelResult<Vec<Vec<Segment>>> {
        let output = self.forward(batch, false)?;
        let mut per_level = Vec::with_capacity(output.levels.len());
        for (level, mask) in output.levels.iter().zip(&output.masks) {
            let probs: Vec<Vec<Vec<f32>>> = ops::sigmoid(&level.cls_logits)?
                .transpose(1, 2)?
                .contiguous()?
                .to_vec3()?;
            let offsets: Vec<Vec<Vec<f32>>> = level.offsets.transpose(1, 2)?.contiguous()?.to_vec3()?;
            let mask: Vec<Vec<f32>> = mask.squeeze(1)?.to_vec2()?;
            per_level.push((probs, offsets, mask));
        }

        let mut results = Vec::with_capacity(batch.len());
        for b in 0..batch.len() {
            let levels: Vec<LevelPrediction> = self
                .layout
                .levels()
                .iter()
                .zip(&per_level)
                .map(|(desc, (probs, offsets, mask))| LevelPrediction {
                    stride: desc.stride,
                    scores: probs[b].iter().flatten().copied().collect(),
                    offsets: offsets[b].iter().map(|o| [o[0], o[1]]).collect(),
                    mask: mask[b].iter().map(|&m| m > 0.5).collect(),
                })
                .collect();
            results.push(decoder.decode(&levels, &batch.plans[b], &batch.metas[b])?);
        }
        Ok(results)
    }

    /// Mean fused level-0 feature of each sample, used for exemplar herding.
    pub fn pooled_embeddings(&self, output: &DetectorOutput) -> ModelResult<Vec<Vec<f32>>> {
        let pooled = ops::masked_mean(&output.fused[0], &output.masks[0])?;
        Ok(pooled.to_vec2()?)
    }
}
