//! Detection heads shared across pyramid levels.
//!
//! Classification produces `num_classes` logits per position, regression a
//! non-negative `(left, right)` distance pair in units of the level stride.
//! Auxiliary heads exist only when their loss weight is positive.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder};

use egoloc_core::config::{ModelConfig, TrainConfig};

use crate::ops::{self, ChannelLayerNorm, SameConv1d};

/// Prior probability assigned to classes without training data.
const EMPTY_CLASS_PRIOR: f64 = 1e-6;

/// Parameter name of the classification bias, relative to the heads' prefix.
pub const CLS_BIAS_NAME: &str = "cls_out.bias";

/// Logit bias giving an initial sigmoid output of `prior`.
pub fn prior_bias(prior: f64) -> f64 {
    -((1.0 - prior) / prior).ln()
}

/// Bias for classes listed in `head_empty_cls`.
pub fn empty_class_bias() -> f64 {
    prior_bias(EMPTY_CLASS_PRIOR)
}

#[derive(Debug, Clone)]
struct ConvStack {
    layers: Vec<(SameConv1d, Option<ChannelLayerNorm>)>,
}

impl ConvStack {
    fn new(
        in_dim: usize,
        dim: usize,
        kernel: usize,
        depth: usize,
        with_ln: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..depth)
            .map(|i| {
                let vb = vb.pp(i.to_string());
                let conv = ops::conv1d_same(if i == 0 { in_dim } else { dim }, dim, kernel, vb.pp("conv"))?;
                let norm = if with_ln {
                    Some(ChannelLayerNorm::new(dim, vb.pp("norm"))?)
                } else {
                    None
                };
                Ok((conv, norm))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for (conv, norm) in &self.layers {
            x = conv.forward(&x)?.broadcast_mul(mask)?;
            if let Some(norm) = norm {
                x = norm.forward(&x)?;
            }
            x = x.relu()?;
        }
        Ok(x)
    }
}

/// Outputs of the heads on one level.
#[derive(Debug, Clone)]
pub struct LevelOutput {
    /// `[B, num_classes, T]`
    pub cls_logits: Tensor,
    /// `[B, 2, T]`, non-negative, in stride units.
    pub offsets: Tensor,
    /// `[B, 1, T]` foreground logits, when the segmentation head exists.
    pub seg_logits: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct DetectionHeads {
    cls_tower: ConvStack,
    cls_out: SameConv1d,
    reg_tower: ConvStack,
    reg_out: SameConv1d,
    /// Learnable scalar per level applied to regression outputs.
    scales: Vec<Tensor>,
    seg_out: Option<SameConv1d>,
    contrastive_proj: Option<SameConv1d>,
    text_proj: Option<Linear>,
}

impl DetectionHeads {
    pub fn new(
        model: &ModelConfig,
        train: &TrainConfig,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let depth = model.head_num_layers - 1;
        let k = model.head_kernel_size;
        let cls_tower = ConvStack::new(model.fpn_dim, model.head_dim, k, depth, model.head_with_ln, vb.pp("cls_tower"))?;
        let reg_tower = ConvStack::new(model.fpn_dim, model.head_dim, k, depth, model.head_with_ln, vb.pp("reg_tower"))?;
        let tower_dim = if depth == 0 { model.fpn_dim } else { model.head_dim };
        let cls_out = ops::conv1d_const_bias(
            tower_dim,
            num_classes,
            k,
            prior_bias(train.cls_prior_prob as f64),
            vb.pp("cls_out"),
        )?;
        let reg_out = ops::conv1d_same(tower_dim, 2, k, vb.pp("reg_out"))?;
        let scales = (0..model.num_levels())
            .map(|l| vb.get_with_hints(1, &format!("scale.{l}"), Init::Const(1.0)))
            .collect::<Result<Vec<_>>>()?;

        let seg_out = if train.seg_loss_weight > 0.0 {
            Some(ops::conv1d_same(model.fpn_dim, 1, k, vb.pp("seg_out"))?)
        } else {
            None
        };
        let contrastive_proj = if train.cont_loss_weight > 0.0 {
            Some(ops::conv1d_same(model.fpn_dim, model.fpn_dim, 1, vb.pp("contrastive_proj"))?)
        } else {
            None
        };
        let text_proj = if train.al_loss_weight > 0.0 || train.cont_loss_weight > 0.0 {
            Some(candle_nn::linear(model.n_txt_in, model.fpn_dim, vb.pp("text_proj"))?)
        } else {
            None
        };
        Ok(Self {
            cls_tower,
            cls_out,
            reg_tower,
            reg_out,
            scales,
            seg_out,
            contrastive_proj,
            text_proj,
        })
    }

    /// Run the heads on level `level`.
    pub fn forward_level(&self, level: usize, x: &Tensor, mask: &Tensor) -> Result<LevelOutput> {
        let cls = self.cls_tower.forward(x, mask)?;
        let cls_logits = self.cls_out.forward(&cls)?.broadcast_mul(mask)?;

        let reg = self.reg_tower.forward(x, mask)?;
        let offsets = self
            .reg_out
            .forward(&reg)?
            .broadcast_mul(&self.scales[level])?
            .relu()?
            .broadcast_mul(mask)?;

        let seg_logits = match &self.seg_out {
            Some(conv) => Some(conv.forward(x)?.broadcast_mul(mask)?),
            None => None,
        };
        Ok(LevelOutput {
            cls_logits,
            offsets,
            seg_logits,
        })
    }

    /// Contrastive projection of fused features, `[B, D, T]`.
    pub fn contrastive_projection(&self, x: &Tensor) -> Result<Option<Tensor>> {
        self.contrastive_proj.as_ref().map(|c| c.forward(x)).transpose()
    }

    /// Text projected into the feature space, `[B, D]`.
    pub fn text_projection(&self, text: &Tensor) -> Result<Option<Tensor>> {
        self.text_proj.as_ref().map(|l| l.forward(text)).transpose()
    }

    pub fn has_segmentation(&self) -> bool {
        self.seg_out.is_some()
    }
}
