//! Residual blocks used by the backbone stem and branch.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::ops::{self, ChannelLayerNorm, SameConv1d};

/// Additive bias used to exclude attention keys.
const MASKED_SCORE: f64 = -1e4;

/// Masked residual conv block: `relu(x + conv(relu(conv(x))))`.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    conv1: SameConv1d,
    conv2: SameConv1d,
}

impl ConvBlock {
    pub fn new(dim: usize, kernel: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: ops::conv1d_same(dim, dim, kernel, vb.pp("conv1"))?,
            conv2: ops::conv1d_same(dim, dim, kernel, vb.pp("conv2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let h = self.conv1.forward(x)?.broadcast_mul(mask)?.relu()?;
        let h = self.conv2.forward(&h)?.broadcast_mul(mask)?;
        x.add(&h)?.relu()
    }
}

/// Multi-head self-attention over time with optional local window.
#[derive(Debug, Clone)]
pub struct TemporalSelfAttention {
    query: SameConv1d,
    key: SameConv1d,
    value: SameConv1d,
    proj: SameConv1d,
    n_head: usize,
    /// Full window width; `<= 1` attends globally.
    window: i64,
    dropout: f32,
}

impl TemporalSelfAttention {
    pub fn new(dim: usize, n_head: usize, window: i64, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            query: ops::conv1d_same(dim, dim, 1, vb.pp("query"))?,
            key: ops::conv1d_same(dim, dim, 1, vb.pp("key"))?,
            value: ops::conv1d_same(dim, dim, 1, vb.pp("value"))?,
            proj: ops::conv1d_same(dim, dim, 1, vb.pp("proj"))?,
            n_head,
            window,
            dropout,
        })
    }

    /// `[B, C, T] -> [B, H, T, C/H]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        x.reshape((b, self.n_head, c / self.n_head, t))?
            .transpose(2, 3)?
            .contiguous()
    }

    /// Additive score bias `[B, 1, T, T]` for padded keys and the local window.
    fn score_bias(&self, mask: &Tensor) -> Result<Tensor> {
        let (_, _, t) = mask.dims3()?;
        // [B, 1, 1, T]: 0 on valid keys, MASKED_SCORE on padding
        let key_bias = mask.affine(-MASKED_SCORE, MASKED_SCORE)?.unsqueeze(1)?;
        if self.window <= 1 {
            return Ok(key_bias);
        }
        let half = (self.window / 2) as usize;
        let band: Vec<f32> = (0..t * t)
            .map(|idx| {
                let (i, j) = (idx / t, idx % t);
                if i.abs_diff(j) > half {
                    MASKED_SCORE as f32
                } else {
                    0.0
                }
            })
            .collect();
        let band = Tensor::from_vec(band, (1, 1, t, t), mask.device())?;
        key_bias.broadcast_add(&band)
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (b, c, t) = x.dims3()?;
        let head_dim = c / self.n_head;
        let q = self.split_heads(&self.query.forward(x)?)?;
        let k = self.split_heads(&self.key.forward(x)?)?;
        let v = self.split_heads(&self.value.forward(x)?)?;

        let scores = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(1.0 / (head_dim as f64).sqrt(), 0.0)?
            .broadcast_add(&self.score_bias(mask)?)?;
        let mut attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        if train && self.dropout > 0.0 {
            attn = candle_nn::ops::dropout(&attn, self.dropout)?;
        }
        // [B, H, T, dh] -> [B, C, T]
        let out = attn
            .matmul(&v)?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, c, t))?;
        self.proj.forward(&out)?.broadcast_mul(mask)
    }
}

/// Pre-LN transformer block with a pointwise MLP and stochastic depth.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    ln_attn: ChannelLayerNorm,
    attn: TemporalSelfAttention,
    ln_mlp: ChannelLayerNorm,
    fc1: SameConv1d,
    fc2: SameConv1d,
    dropout: f32,
    droppath: f32,
}

impl TransformerBlock {
    pub fn new(
        dim: usize,
        n_head: usize,
        window: i64,
        dropout: f32,
        droppath: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            ln_attn: ChannelLayerNorm::new(dim, vb.pp("ln_attn"))?,
            attn: TemporalSelfAttention::new(dim, n_head, window, dropout, vb.pp("attn"))?,
            ln_mlp: ChannelLayerNorm::new(dim, vb.pp("ln_mlp"))?,
            fc1: ops::conv1d_same(dim, 4 * dim, 1, vb.pp("fc1"))?,
            fc2: ops::conv1d_same(4 * dim, dim, 1, vb.pp("fc2"))?,
            dropout,
            droppath,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.attn.forward(&self.ln_attn.forward(x)?, mask, train)?;
        let x = x.add(&ops::drop_path(&h, self.droppath, train)?)?;

        let mut h = self.fc1.forward(&self.ln_mlp.forward(&x)?)?.gelu()?;
        if train && self.dropout > 0.0 {
            h = candle_nn::ops::dropout(&h, self.dropout)?;
        }
        let h = self.fc2.forward(&h)?.broadcast_mul(mask)?;
        x.add(&ops::drop_path(&h, self.droppath, train)?)
    }
}

/// Either block type behind one interface.
#[derive(Debug, Clone)]
pub enum Block {
    Conv(ConvBlock),
    Transformer(TransformerBlock),
}

impl Block {
    pub fn forward(&self, x: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Block::Conv(block) => block.forward(x, mask),
            Block::Transformer(block) => block.forward(x, mask, train),
        }
    }
}
