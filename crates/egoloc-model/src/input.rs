//! Batch preparation: modality concatenation, cropping, upsampling, padding.
//!
//! Every sample leaves here on the fixed `[input_dim, max_seq_len]` grid the
//! pyramid is built on, together with the [`SequencePlan`] that maps grid
//! coordinates back to the caller's feature grid.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use egoloc_core::config::{ExperimentConfig, OutputFormat};
use egoloc_core::pyramid::truncate_window;
use egoloc_core::{GroundTruth, SequencePlan, SequencePolicy, VideoMeta};

use crate::error::{ModelError, ModelResult};
use crate::ops;

/// One video as handed over by the data loader.
#[derive(Debug, Clone)]
pub struct VideoSample {
    pub sample_id: String,
    /// `[C_i, L]` per modality; a single tensor for `output_format: concat`.
    pub features: Vec<Tensor>,
    /// `[n_txt_in]` query embedding.
    pub text: Option<Tensor>,
    /// Actions on the caller's feature grid.
    pub ground_truth: Vec<GroundTruth>,
    pub meta: VideoMeta,
}

/// A batch on the pyramid grid.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub sample_ids: Vec<String>,
    /// `[B, input_dim, max_seq_len]`
    pub features: Tensor,
    /// `[B, 1, max_seq_len]`
    pub mask: Tensor,
    /// `[B, n_txt_in]`
    pub text: Option<Tensor>,
    pub plans: Vec<SequencePlan>,
    /// Ground truth projected onto the grid.
    pub ground_truth: Vec<Vec<GroundTruth>>,
    pub metas: Vec<VideoMeta>,
}

impl PreparedBatch {
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    /// Every class label referenced by the batch.
    pub fn labels(&self) -> impl Iterator<Item = usize> + '_ {
        self.ground_truth.iter().flatten().map(|gt| gt.label)
    }
}

pub struct BatchBuilder {
    policy: SequencePolicy,
    input_dim: usize,
    output_format: OutputFormat,
    n_txt_in: usize,
    trunc_thresh: f32,
    crop_ratio: Option<[f32; 2]>,
    rng: StdRng,
    device: Device,
}

impl BatchBuilder {
    pub fn new(config: &ExperimentConfig, device: &Device) -> Self {
        Self {
            policy: SequencePolicy::from_config(&config.model, &config.dataset),
            input_dim: config.dataset.input_dim,
            output_format: config.dataset.output_format,
            n_txt_in: config.model.n_txt_in,
            trunc_thresh: config.dataset.trunc_thresh,
            crop_ratio: config.dataset.crop_ratio,
            rng: StdRng::seed_from_u64(config.init_rand_seed),
            device: device.clone(),
        }
    }

    pub fn policy(&self) -> &SequencePolicy {
        &self.policy
    }

    /// Training batch: long (or randomly cropped) sequences are cut to a
    /// window that keeps its actions. Plans are relative to the crop.
    pub fn training_batch(&mut self, samples: &[VideoSample]) -> ModelResult<PreparedBatch> {
        let mut prepared = Vec::with_capacity(samples.len());
        for sample in samples {
            let feats = self.merge_modalities(sample)?;
            let len = feats.dim(1)?;
            let crop = truncate_window(
                len,
                &sample.ground_truth,
                self.policy.max_seq_len,
                self.trunc_thresh,
                self.crop_ratio,
                &mut self.rng,
            );
            let (feats, gts) = match crop {
                Some(window) => {
                    trace!(sample = %sample.sample_id, start = window.start, end = window.end, "Cropped training window");
                    (feats.narrow(1, window.start, window.end - window.start)?, window.ground_truth)
                }
                None => (feats, sample.ground_truth.clone()),
            };
            let plan = self.policy.plan(feats.dim(1)?)?;
            prepared.push(self.place_on_grid(feats, plan, &gts)?);
        }
        self.assemble(samples, prepared)
    }

    /// Inference batch: long sequences keep their leading window.
    pub fn inference_batch(&self, samples: &[VideoSample]) -> ModelResult<PreparedBatch> {
        let mut prepared = Vec::with_capacity(samples.len());
        for sample in samples {
            let feats = self.merge_modalities(sample)?;
            let plan = self.policy.plan(feats.dim(1)?)?;
            prepared.push(self.place_on_grid(feats, plan, &sample.ground_truth)?);
        }
        self.assemble(samples, prepared)
    }

    /// Concatenate modalities along channels and check the width.
    fn merge_modalities(&self, sample: &VideoSample) -> ModelResult<Tensor> {
        let parts = &sample.features;
        if parts.is_empty() {
            return Err(ModelError::shape("modality tensors", 1, 0));
        }
        if self.output_format == OutputFormat::Concat && parts.len() != 1 {
            return Err(ModelError::shape("modality tensors for concat output", 1, parts.len()));
        }
        let len = parts[0].dim(1)?;
        for part in &parts[1..] {
            let other = part.dim(1)?;
            if other != len {
                return Err(ModelError::shape("modality sequence length", len, other));
            }
        }
        let feats = if parts.len() == 1 {
            parts[0].clone()
        } else {
            Tensor::cat(parts, 0)?
        };
        let channels = feats.dim(0)?;
        if channels != self.input_dim {
            return Err(ModelError::shape("feature channels", self.input_dim, channels));
        }
        Ok(feats.to_device(&self.device)?.to_dtype(DType::F32)?)
    }

    /// Keep the plan's window, resample it if needed and pad to `max_seq_len`.
    fn place_on_grid(
        &self,
        feats: Tensor,
        plan: SequencePlan,
        gts: &[GroundTruth],
    ) -> ModelResult<(Tensor, Tensor, SequencePlan, Vec<GroundTruth>)> {
        let mut window = feats.narrow(1, plan.window_start, plan.window_len)?;
        if plan.is_resampled() {
            let weights = ops::interpolation_matrix(plan.window_len, plan.valid_len, &self.device)?;
            window = window.matmul(&weights)?;
        }
        let pad = plan.padded_len - plan.valid_len;
        let grid = window.pad_with_zeros(1, 0, pad)?;
        let mask: Vec<f32> = (0..plan.padded_len)
            .map(|t| if t < plan.valid_len { 1.0 } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, (1, plan.padded_len), &self.device)?;
        let gts = self.policy.project_ground_truth(&plan, gts);
        Ok((grid, mask, plan, gts))
    }

    fn assemble(
        &self,
        samples: &[VideoSample],
        prepared: Vec<(Tensor, Tensor, SequencePlan, Vec<GroundTruth>)>,
    ) -> ModelResult<PreparedBatch> {
        if samples.is_empty() {
            return Err(ModelError::shape("batch size", 1, 0));
        }
        let mut feats = Vec::with_capacity(prepared.len());
        let mut masks = Vec::with_capacity(prepared.len());
        let mut plans = Vec::with_capacity(prepared.len());
        let mut ground_truth = Vec::with_capacity(prepared.len());
        for (f, m, p, g) in prepared {
            feats.push(f);
            masks.push(m);
            plans.push(p);
            ground_truth.push(g);
        }

        let with_text = samples.iter().filter(|s| s.text.is_some()).count();
        let text = if with_text == 0 {
            None
        } else if with_text != samples.len() {
            return Err(ModelError::shape("samples with text embeddings", samples.len(), with_text));
        } else {
            let rows = samples
                .iter()
                .filter_map(|s| s.text.as_ref())
                .map(|t| {
                    let t = t.flatten_all()?;
                    let width = t.dim(0)?;
                    if width != self.n_txt_in {
                        return Err(ModelError::shape("text embedding width", self.n_txt_in, width));
                    }
                    Ok(t.to_device(&self.device)?.to_dtype(DType::F32)?)
                })
                .collect::<ModelResult<Vec<_>>>()?;
            Some(Tensor::stack(&rows, 0)?)
        };

        Ok(PreparedBatch {
            sample_ids: samples.iter().map(|s| s.sample_id.clone()).collect(),
            features: Tensor::stack(&feats, 0)?,
            mask: Tensor::stack(&masks, 0)?,
            text,
            plans,
            ground_truth,
            metas: samples.iter().map(|s| s.meta).collect(),
        })
    }
}

/// Deterministic samples of the given lengths with text and ground truth.
#[cfg(test)]
pub(crate) fn synthetic_samples(config: &ExperimentConfig, lengths: &[usize], device: &Device) -> Vec<VideoSample> {
    lengths
        .iter()
        .enumerate()
        .map(|(i, &len)| {
            let video = egoloc_test_utils::synthetic_video(config, len, i as u64, device);
            VideoSample {
                sample_id: video.sample_id,
                features: vec![video.features],
                text: Some(video.text),
                ground_truth: video.ground_truth,
                meta: video.meta,
            }
        })
        .collect()
}
