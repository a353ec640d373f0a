//! Tensor helpers shared by the network modules.
//!
//! Temporal features are laid out `[batch, channels, time]` throughout, with
//! validity masks `[batch, 1, time]` holding `1.0` on real positions.

use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Init, LayerNorm, VarBuilder};

/// Logistic sigmoid built from differentiable primitives.
pub fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// Elementwise binary cross-entropy on logits, numerically stable.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    logits.relu()?.sub(&logits.mul(targets)?)?.add(&softplus)
}

/// Copy a tensor out of the autograd graph.
pub fn detached(t: &Tensor) -> Result<Tensor> {
    let values = t.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    Tensor::from_vec(values, t.shape().clone(), t.device())
}

/// Length-preserving Conv1d (odd kernels only).
///
/// The input is zero-padded before an unpadded convolution, so the backward
/// pass never sees a sequence shorter than the kernel even on the coarsest
/// pyramid levels.
#[derive(Debug, Clone)]
pub struct SameConv1d {
    inner: Conv1d,
    pad: usize,
}

impl SameConv1d {
    fn new(weight: Tensor, bias: Option<Tensor>, kernel: usize) -> Self {
        Self {
            inner: Conv1d::new(weight, bias, Conv1dConfig::default()),
            pad: kernel / 2,
        }
    }
}

impl Module for SameConv1d {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if self.pad == 0 {
            return self.inner.forward(x);
        }
        self.inner.forward(&x.pad_with_zeros(2, self.pad, self.pad)?)
    }
}

pub fn conv1d_same(in_dim: usize, out_dim: usize, kernel: usize, vb: VarBuilder) -> Result<SameConv1d> {
    let conv = candle_nn::conv1d(in_dim, out_dim, kernel, Conv1dConfig::default(), vb)?;
    Ok(SameConv1d::new(conv.weight().clone(), conv.bias().cloned(), kernel))
}

/// Length-preserving Conv1d with every bias entry set to `bias`.
pub fn conv1d_const_bias(
    in_dim: usize,
    out_dim: usize,
    kernel: usize,
    bias: f64,
    vb: VarBuilder,
) -> Result<SameConv1d> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim, kernel),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(bias))?;
    Ok(SameConv1d::new(weight, Some(bias), kernel))
}

/// LayerNorm over the channel axis of a `[B, C, T]` tensor.
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    inner: LayerNorm,
}

impl ChannelLayerNorm {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: candle_nn::layer_norm(dim, 1e-5, vb)?,
        })
    }
}

impl Module for ChannelLayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?.contiguous()?;
        self.inner.forward(&x)?.transpose(1, 2)?.contiguous()
    }
}

/// Max-pool by `factor` along time. The length must be a multiple of `factor`.
pub fn downsample_max(x: &Tensor, factor: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    x.reshape((b, c, t / factor, factor))?.max(D::Minus1)
}

/// Keep the first position of every `factor` window of a mask.
pub fn downsample_mask(mask: &Tensor, factor: usize) -> Result<Tensor> {
    let (b, c, t) = mask.dims3()?;
    mask.reshape((b, c, t / factor, factor))?
        .narrow(3, 0, 1)?
        .squeeze(3)
}

/// Repeat every position `factor` times along time.
pub fn upsample_nearest(x: &Tensor, factor: usize) -> Result<Tensor> {
    let (b, c, t) = x.dims3()?;
    x.unsqueeze(3)?
        .broadcast_as((b, c, t, factor))?
        .contiguous()?
        .reshape((b, c, t * factor))
}

/// `[src, dst]` matrix that linearly resamples a sequence of `src` positions to
/// `dst` positions when right-multiplied (half-pixel centers).
pub fn interpolation_matrix(src: usize, dst: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; src * dst];
    let scale = src as f32 / dst as f32;
    for j in 0..dst {
        let x = ((j as f32 + 0.5) * scale - 0.5).clamp(0.0, (src - 1) as f32);
        let i0 = x.floor() as usize;
        let i1 = (i0 + 1).min(src - 1);
        let w = x - i0 as f32;
        weights[i0 * dst + j] += 1.0 - w;
        weights[i1 * dst + j] += w;
    }
    Tensor::from_vec(weights, (src, dst), device)
}

/// Fixed sinusoidal position encoding, `[1, dim, len]`.
pub fn sinusoidal_encoding(dim: usize, len: usize, device: &Device) -> Result<Tensor> {
    let mut table = vec![0f32; dim * len];
    for i in 0..dim {
        let freq = 1.0 / 10000f32.powf((2 * (i / 2)) as f32 / dim as f32);
        for t in 0..len {
            let angle = t as f32 * freq;
            table[i * len + t] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Tensor::from_vec(table, (1, dim, len), device)
}

/// Stochastic depth: zero whole samples of a residual branch with probability `p`.
pub fn drop_path(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if !train || p <= 0.0 {
        return Ok(x.clone());
    }
    let b = x.dim(0)?;
    let keep = Tensor::rand(0f32, 1f32, (b, 1, 1), x.device())?
        .ge(p as f64)?
        .to_dtype(x.dtype())?
        .affine(1.0 / (1.0 - p as f64), 0.0)?;
    x.broadcast_mul(&keep)
}

/// Mean of `x` over the valid positions of `mask`, `[B, C]`.
pub fn masked_mean(x: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let total = x.broadcast_mul(mask)?.sum(D::Minus1)?;
    let count = mask.sum(D::Minus1)?.maximum(1.0)?;
    total.broadcast_div(&count)
}

/// Rows scaled to unit L2 norm.
pub fn l2_normalize(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(1e-6)?;
    x.broadcast_div(&norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid_and_bce() {
        let device = Device::Cpu;
        let x = Tensor::new(&[0f32, 2.0, -2.0], &device).unwrap();
        let s: Vec<f32> = sigmoid(&x).unwrap().to_vec1().unwrap();
        assert!((s[0] - 0.5).abs() < 1e-6);
        assert!((s[1] - 0.880797).abs() < 1e-5);

        let t = Tensor::new(&[1f32, 1.0, 0.0], &device).unwrap();
        let l: Vec<f32> = bce_with_logits(&x, &t).unwrap().to_vec1().unwrap();
        assert!((l[0] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((l[1] - (-(0.880797f32).ln())).abs() < 1e-5);
        assert!((l[2] - (-(0.880797f32).ln())).abs() < 1e-5);
    }

    #[test]
    fn test_downsample_and_upsample() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[1f32, 5.0, 2.0, 0.0]]], &device).unwrap();
        let down: Vec<f32> = downsample_max(&x, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(down, vec![5.0, 2.0]);
        let up: Vec<f32> = upsample_nearest(&x, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(up, vec![1.0, 1.0, 5.0, 5.0, 2.0, 2.0, 0.0, 0.0]);

        let mask = Tensor::new(&[[[1f32, 1.0, 1.0, 0.0]]], &device).unwrap();
        let m: Vec<f32> = downsample_mask(&mask, 2).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(m, vec![1.0, 1.0]);
    }

    #[test]
    fn test_interpolation_matrix_preserves_constants() {
        let device = Device::Cpu;
        let w = interpolation_matrix(5, 8, &device).unwrap();
        let ones = Tensor::ones((1, 5), DType::F32, &device).unwrap();
        let out: Vec<f32> = ones.matmul(&w).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(out.len(), 8);
        assert!(out.iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_masked_mean_ignores_padding() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[2f32, 4.0, 100.0]]], &device).unwrap();
        let mask = Tensor::new(&[[[1f32, 1.0, 0.0]]], &device).unwrap();
        let m: Vec<f32> = masked_mean(&x, &mask).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(m, vec![3.0]);
    }

    #[test]
    fn test_detached_copy_matches() {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &device).unwrap();
        let y = detached(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
        assert_eq!(y.to_vec2::<f32>().unwrap(), x.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_same_conv_backward_on_sequences_shorter_than_kernel() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = conv1d_same(4, 4, 3, vb.pp("conv")).unwrap();
        for len in 1..=4 {
            let x = Tensor::ones((1, 4, len), DType::F32, &device).unwrap();
            let y = conv.forward(&x).unwrap();
            assert_eq!(y.dims(), &[1, 4, len]);
            let grads = y.sqr().unwrap().sum_all().unwrap().backward().unwrap();
            assert!(varmap.all_vars().iter().all(|v| grads.get(v.as_tensor()).is_some()));
        }
    }
}
