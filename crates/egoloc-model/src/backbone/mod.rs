//! Feature pyramid builder.
//!
//! `backbone_arch = [embedding convs, stem blocks, branch blocks]`:
//!
//! ```text
//! [B, input_dim, T] ─ embedding convs ─ (+ abs PE) ─ stem blocks ─► level 0
//!                                                      │
//!                                     max-pool ÷ scale_factor, block ─► level 1
//!                                                      ⋮
//!                                     max-pool ÷ scale_factor, block ─► level N-1
//! ```
//!
//! The neck then brings every level to `fpn_dim`.

mod blocks;
mod neck;

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use egoloc_core::config::{BackboneType, ModelConfig, TrainConfig};

use crate::ops::{self, ChannelLayerNorm, SameConv1d};

pub use blocks::{Block, ConvBlock, TemporalSelfAttention, TransformerBlock};
pub use neck::Neck;

/// Per-level features and their validity masks.
#[derive(Debug, Clone)]
pub struct Pyramid {
    /// `[B, C, T_l]` per level.
    pub feats: Vec<Tensor>,
    /// `[B, 1, T_l]` per level.
    pub masks: Vec<Tensor>,
}

impl Pyramid {
    pub fn num_levels(&self) -> usize {
        self.feats.len()
    }
}

#[derive(Debug, Clone)]
struct EmbeddingLayer {
    conv: SameConv1d,
    norm: Option<ChannelLayerNorm>,
}

#[derive(Debug, Clone)]
pub struct Backbone {
    embedding: Vec<EmbeddingLayer>,
    abs_pe: Option<Tensor>,
    stem: Vec<Block>,
    branch: Vec<Block>,
    scale_factor: usize,
}

fn make_block(
    model: &ModelConfig,
    train: &TrainConfig,
    vb: VarBuilder,
) -> Result<Block> {
    Ok(match model.backbone_type {
        BackboneType::Conv => Block::Conv(ConvBlock::new(model.embd_dim, 3, vb)?),
        BackboneType::ConvTransformer => Block::Transformer(TransformerBlock::new(
            model.embd_dim,
            model.n_head,
            model.n_mha_win_size,
            train.dropout,
            train.droppath,
            vb,
        )?),
    })
}

impl Backbone {
    pub fn new(
        model: &ModelConfig,
        train: &TrainConfig,
        input_dim: usize,
        max_seq_len: usize,
        vb: VarBuilder,
        device: &Device,
    ) -> Result<Self> {
        let [n_embd, n_stem, n_branch] = model.backbone_arch;
        let embedding = (0..n_embd)
            .map(|i| {
                let in_dim = if i == 0 { input_dim } else { model.embd_dim };
                let vb = vb.pp(format!("embd.{i}"));
                Ok(EmbeddingLayer {
                    conv: ops::conv1d_same(in_dim, model.embd_dim, model.embd_kernel_size, vb.pp("conv"))?,
                    norm: if model.embd_with_ln {
                        Some(ChannelLayerNorm::new(model.embd_dim, vb.pp("norm"))?)
                    } else {
                        None
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let abs_pe = if model.use_abs_pe {
            Some(ops::sinusoidal_encoding(model.embd_dim, max_seq_len, device)?.affine(
                1.0 / (model.embd_dim as f64).sqrt(),
                0.0,
            )?)
        } else {
            None
        };
        let stem = (0..n_stem)
            .map(|i| make_block(model, train, vb.pp(format!("stem.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let branch = (0..n_branch)
            .map(|i| make_block(model, train, vb.pp(format!("branch.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            backbone = ?model.backbone_type,
            n_embd,
            n_stem,
            n_branch,
            "Built backbone"
        );
        Ok(Self {
            embedding,
            abs_pe,
            stem,
            branch,
            scale_factor: model.scale_factor,
        })
    }

    /// `x: [B, input_dim, T]`, `mask: [B, 1, T]` → `backbone_arch[2] + 1` levels.
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Pyramid> {
        let mut x = x.clone();
        for layer in &self.embedding {
            x = layer.conv.forward(&x)?.broadcast_mul(mask)?;
            if let Some(norm) = &layer.norm {
                x = norm.forward(&x)?;
            }
            x = x.relu()?;
        }
        if let Some(pe) = &self.abs_pe {
            let t = x.dim(2)?;
            x = x.broadcast_add(&pe.narrow(2, 0, t)?)?.broadcast_mul(mask)?;
        }
        for block in &self.stem {
            x = block.forward(&x, mask, train)?;
        }

        let mut feats = vec![x.clone()];
        let mut masks = vec![mask.clone()];
        let mut mask = mask.clone();
        for block in &self.branch {
            mask = ops::downsample_mask(&mask, self.scale_factor)?;
            x = ops::downsample_max(&x, self.scale_factor)?.broadcast_mul(&mask)?;
            x = block.forward(&x, &mask, train)?;
            feats.push(x.clone());
            masks.push(mask.clone());
        }
        Ok(Pyramid { feats, masks })
    }
}
