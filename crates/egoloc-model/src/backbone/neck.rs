//! Neck: projects every pyramid level to `fpn_dim`.

use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

use egoloc_core::config::{FpnType, ModelConfig};

use crate::ops::{self, ChannelLayerNorm, SameConv1d};

use super::Pyramid;

#[derive(Debug, Clone)]
pub struct Neck {
    kind: FpnType,
    lateral: Vec<SameConv1d>,
    /// Post-merge smoothing convs, FPN only.
    output: Vec<SameConv1d>,
    norms: Vec<ChannelLayerNorm>,
    scale_factor: usize,
}

impl Neck {
    pub fn new(model: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let levels = model.num_levels();
        let lateral = (0..levels)
            .map(|l| ops::conv1d_same(model.embd_dim, model.fpn_dim, 1, vb.pp(format!("lateral.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        let output = match model.fpn_type {
            FpnType::Identity => Vec::new(),
            FpnType::Fpn => (0..levels)
                .map(|l| ops::conv1d_same(model.fpn_dim, model.fpn_dim, 3, vb.pp(format!("output.{l}"))))
                .collect::<Result<Vec<_>>>()?,
        };
        let norms = if model.fpn_with_ln {
            (0..levels)
                .map(|l| ChannelLayerNorm::new(model.fpn_dim, vb.pp(format!("norm.{l}"))))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        Ok(Self {
            kind: model.fpn_type,
            lateral,
            output,
            norms,
            scale_factor: model.scale_factor,
        })
    }

    pub fn forward(&self, pyramid: &Pyramid) -> Result<Pyramid> {
        let mut feats = pyramid
            .feats
            .iter()
            .zip(&pyramid.masks)
            .zip(&self.lateral)
            .map(|((x, mask), conv)| conv.forward(x)?.broadcast_mul(mask))
            .collect::<Result<Vec<_>>>()?;

        if self.kind == FpnType::Fpn {
            // top-down: each level receives the upsampled coarser level
            for l in (0..feats.len().saturating_sub(1)).rev() {
                let coarse = ops::upsample_nearest(&feats[l + 1], self.scale_factor)?;
                feats[l] = feats[l].add(&coarse)?.broadcast_mul(&pyramid.masks[l])?;
            }
            for (l, conv) in self.output.iter().enumerate() {
                feats[l] = conv.forward(&feats[l])?.broadcast_mul(&pyramid.masks[l])?;
            }
        }

        for (l, norm) in self.norms.iter().enumerate() {
            feats[l] = norm.forward(&feats[l])?.broadcast_mul(&pyramid.masks[l])?;
        }
        Ok(Pyramid {
            feats,
            masks: pyramid.masks.clone(),
        })
    }
}
