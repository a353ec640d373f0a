//! Cross-modal fusion: conditions every pyramid level on the query text.
//!
//! Gated multi-head cross-attention. The projected text embedding is the query
//! against each temporal position's key; per head the scaled dot product goes
//! through a sigmoid and gates the projected text value at that position. The
//! gated values are merged, projected and added back to the features, followed
//! by LayerNorm. The same weights serve every level.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use egoloc_core::config::ModelConfig;

use crate::error::{ModelError, ModelResult};
use crate::ops::{self, ChannelLayerNorm};

#[derive(Debug, Clone)]
struct GatedCrossAttention {
    text_query: Linear,
    text_value: Linear,
    key: Linear,
    out: Linear,
    norm: ChannelLayerNorm,
    n_head: usize,
}

impl GatedCrossAttention {
    /// `feats: [B, D, T]`, `mask: [B, 1, T]`, `text: [B, n_txt_in]`.
    fn forward(&self, feats: &Tensor, mask: &Tensor, text: &Tensor) -> ModelResult<Tensor> {
        let (b, d, t) = feats.dims3()?;
        let h = self.n_head;
        let dh = d / h;

        // [B, H, 1, dh]
        let q = self.text_query.forward(text)?.reshape((b, h, 1, dh))?;
        let v = self.text_value.forward(text)?.reshape((b, h, 1, dh))?;
        // [B, T, D] -> [B, H, T, dh]
        let x = feats.transpose(1, 2)?.contiguous()?;
        let k = self
            .key
            .forward(&x)?
            .reshape((b, t, h, dh))?
            .transpose(1, 2)?
            .contiguous()?;

        // [B, H, T, 1]
        let scores = k
            .matmul(&q.transpose(2, 3)?.contiguous()?)?
            .affine(1.0 / (dh as f64).sqrt(), 0.0)?;
        let gate = ops::sigmoid(&scores)?;
        let gated = gate.broadcast_mul(&v)?;
        // [B, H, T, dh] -> [B, T, D]
        let merged = gated.transpose(1, 2)?.contiguous()?.reshape((b, t, d))?;
        let fused = x.add(&self.out.forward(&merged)?)?;
        let fused = fused.transpose(1, 2)?.contiguous()?;
        Ok(self.norm.forward(&fused)?.broadcast_mul(mask)?)
    }
}

/// Fusion encoder; a passthrough when cross-modal conditioning is disabled.
#[derive(Debug, Clone)]
pub struct CrossModalFusion {
    inner: Option<GatedCrossAttention>,
    n_txt_in: usize,
}

impl CrossModalFusion {
    pub fn new(model: &ModelConfig, vb: VarBuilder) -> ModelResult<Self> {
        let inner = if model.use_cross_modal {
            let d = model.fpn_dim;
            Some(GatedCrossAttention {
                text_query: candle_nn::linear(model.n_txt_in, d, vb.pp("text_query"))?,
                text_value: candle_nn::linear(model.n_txt_in, d, vb.pp("text_value"))?,
                key: candle_nn::linear(d, d, vb.pp("key"))?,
                out: candle_nn::linear(d, d, vb.pp("out"))?,
                norm: ChannelLayerNorm::new(d, vb.pp("norm"))?,
                n_head: model.n_head,
            })
        } else {
            None
        };
        Ok(Self {
            inner,
            n_txt_in: model.n_txt_in,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Fuse every level with the text. Shapes are preserved.
    ///
    /// # Errors
    ///
    /// `ShapeMismatch` when fusion is enabled and the text is missing or its
    /// width differs from `n_txt_in`.
    pub fn forward(
        &self,
        feats: &[Tensor],
        masks: &[Tensor],
        text: Option<&Tensor>,
    ) -> ModelResult<Vec<Tensor>> {
        let Some(inner) = &self.inner else {
            return Ok(feats.to_vec());
        };
        let text = text.ok_or_else(|| ModelError::shape("text embedding width", self.n_txt_in, 0))?;
        let (b, width) = text.dims2()?;
        if width != self.n_txt_in {
            return Err(ModelError::shape("text embedding width", self.n_txt_in, width));
        }
        if let Some(first) = feats.first() {
            let fb = first.dim(0)?;
            if fb != b {
                return Err(ModelError::shape("text embedding batch", fb, b));
            }
        }
        feats
            .iter()
            .zip(masks)
            .map(|(x, mask)| inner.forward(x, mask, text))
            .collect()
    }
}
