//! Deterministic synthetic data for egoloc tests.
//!
//! Everything here is seeded: the same `(config, length, seed)` always yields
//! the same features, text and ground truth, so tests never depend on
//! thread-local entropy. Tensors have the real shapes the detector consumes.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use egoloc_core::{ExperimentConfig, GroundTruth, VideoMeta};

/// Small configuration: 4 levels over a 64-step grid, 6 input channels,
/// 3 classes, conv backbone, cross-modal fusion on.
pub const TINY_CONFIG_YAML: &str = include_str!("../../egoloc-core/tests/fixtures/tiny.yaml");

const FALLBACK_FPS: f32 = 30.0;

pub fn tiny_config() -> ExperimentConfig {
    ExperimentConfig::from_yaml_str(TINY_CONFIG_YAML).expect("tiny fixture config must be valid")
}

/// The full-depth geometry (1024-step grid, `backbone_arch [2, 2, 9]`,
/// 10 levels, up to 200 segments) with tiny channel widths.
pub fn e2e_config() -> ExperimentConfig {
    let mut config = tiny_config();
    config.dataset.max_seq_len = 1024;
    config.dataset.force_upsampling = true;
    config.model.backbone_arch = [2, 2, 9];
    config.model.regression_range = vec![
        [0.0, 4.0],
        [4.0, 8.0],
        [8.0, 16.0],
        [16.0, 32.0],
        [32.0, 64.0],
        [64.0, 128.0],
        [128.0, 256.0],
        [256.0, 512.0],
        [512.0, 1024.0],
        [1024.0, 10000.0],
    ];
    config.test_cfg.max_seg_num = 200;
    config.test_cfg.pre_nms_topk = 2000;
    config.test_cfg.nms_method = egoloc_core::config::NmsMethod::Soft;
    config.validate().expect("e2e config must be valid");
    config
}

/// One synthetic video with a single concatenated modality tensor.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    pub sample_id: String,
    /// `[input_dim, len]`
    pub features: Tensor,
    /// `[n_txt_in]`
    pub text: Tensor,
    pub ground_truth: Vec<GroundTruth>,
    pub meta: VideoMeta,
}

/// Uniform features in `[-1, 1]` with a `+1` offset on channel 0 inside each
/// ground-truth span.
pub fn synthetic_features(dim: usize, len: usize, gts: &[GroundTruth], seed: u64, device: &Device) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values: Vec<f32> = (0..dim * len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    for gt in gts {
        let lo = gt.start.floor().max(0.0) as usize;
        let hi = (gt.end.ceil() as usize).min(len);
        for t in lo..hi {
            values[t] += 1.0;
        }
    }
    Tensor::from_vec(values, (dim, len), device).expect("feature shape matches data")
}

/// Unit-norm text embedding.
pub fn synthetic_text(dim: usize, seed: u64, device: &Device) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(0x5eed));
    let mut values: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    Tensor::from_vec(values, dim, device).expect("text shape matches data")
}

/// One or two actions covering fixed fractions of the sequence.
pub fn synthetic_ground_truth(len: usize, num_classes: usize, seed: u64) -> Vec<GroundTruth> {
    let len_f = len as f32;
    let first_label = (seed as usize) % num_classes;
    let start = (0.2 * len_f).floor();
    let end = (0.45 * len_f).ceil().max(start + 1.0);
    let mut gts = vec![GroundTruth::new(start, end, first_label).expect("start < end")];
    if len >= 10 {
        let second = GroundTruth::new((0.6 * len_f).floor(), (0.85 * len_f).ceil(), (first_label + 1) % num_classes)
            .expect("start < end");
        gts.push(second);
    }
    gts
}

/// Timing whose duration covers every feature window of a `len`-step sequence.
pub fn synthetic_meta(config: &ExperimentConfig, len: usize) -> VideoMeta {
    let fps = config.dataset.default_fps.unwrap_or(FALLBACK_FPS);
    let stride = config.dataset.feat_stride;
    let frames = config.dataset.num_frames;
    VideoMeta {
        fps,
        duration: (len.saturating_sub(1) as f32 * stride as f32 + frames as f32) / fps,
        feat_stride: stride,
        num_frames: frames,
    }
}

pub fn synthetic_video(config: &ExperimentConfig, len: usize, seed: u64, device: &Device) -> SyntheticVideo {
    let ground_truth = synthetic_ground_truth(len, config.dataset.num_classes, seed);
    SyntheticVideo {
        sample_id: format!("synthetic_{seed}_{len}"),
        features: synthetic_features(config.dataset.input_dim, len, &ground_truth, seed, device),
        text: synthetic_text(config.model.n_txt_in, seed, device),
        ground_truth,
        meta: synthetic_meta(config, len),
    }
}
