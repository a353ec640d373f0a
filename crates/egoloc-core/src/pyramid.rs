//! Feature pyramid geometry.
//!
//! The pyramid is described by an arena of [`LevelDescriptor`]s indexed
//! `0..N-1`, fixed once the configuration is loaded. Tensor work lives in
//! `egoloc-model`; this module owns the shapes, strides, regression ranges and
//! the policy that turns an arbitrary-length input into the fixed
//! `max_seq_len` grid the pyramid is built on.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{DatasetConfig, ModelConfig};
use crate::error::{CoreError, CoreResult};
use crate::types::GroundTruth;

/// One temporal resolution of the pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelDescriptor {
    pub index: usize,
    /// Number of candidate positions on this level.
    pub length: usize,
    /// Feature-grid distance between consecutive positions.
    pub stride: usize,
    /// Half-open `[min, max)` range of regression distances owned by this level.
    pub regression_range: (f32, f32),
    /// Offset of this level's first position in the flattened position list.
    pub offset: usize,
}

impl LevelDescriptor {
    /// Feature-grid coordinate of a position on this level.
    #[inline]
    pub fn coordinate(&self, index: usize) -> f32 {
        (index * self.stride) as f32
    }

    /// Whether a regression distance belongs to this level.
    #[inline]
    pub fn owns_distance(&self, distance: f32) -> bool {
        distance >= self.regression_range.0 && distance < self.regression_range.1
    }
}

/// Arena of level descriptors for a fixed input length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidLayout {
    levels: Vec<LevelDescriptor>,
    seq_len: usize,
}

impl PyramidLayout {
    /// Build the layout for `seq_len` input positions.
    ///
    /// Level `l` has stride `scale_factor^l` and length
    /// `floor(seq_len / scale_factor^l)`.
    pub fn new(model: &ModelConfig, seq_len: usize) -> CoreResult<Self> {
        let num_levels = model.num_levels();
        if model.regression_range.len() != num_levels {
            return Err(CoreError::config(format!(
                "regression_range has {} entries but the pyramid has {} levels",
                model.regression_range.len(),
                num_levels
            )));
        }
        let mut levels = Vec::with_capacity(num_levels);
        let mut offset = 0;
        for (index, range) in model.regression_range.iter().enumerate() {
            let stride = model.scale_factor.pow(index as u32);
            let length = seq_len / stride;
            if length == 0 {
                return Err(CoreError::config(format!(
                    "sequence length {seq_len} is too short for pyramid level {index} (stride {stride})"
                )));
            }
            levels.push(LevelDescriptor {
                index,
                length,
                stride,
                regression_range: (range[0], range[1]),
                offset,
            });
            offset += length;
        }
        Ok(Self { levels, seq_len })
    }

    /// Layout for the configured `max_seq_len`.
    pub fn from_config(model: &ModelConfig, dataset: &DatasetConfig) -> CoreResult<Self> {
        Self::new(model, dataset.max_seq_len)
    }

    #[inline]
    pub fn levels(&self) -> &[LevelDescriptor] {
        &self.levels
    }

    #[inline]
    pub fn level(&self, index: usize) -> Option<&LevelDescriptor> {
        self.levels.get(index)
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Total number of candidate positions over all levels.
    pub fn total_positions(&self) -> usize {
        self.levels.iter().map(|l| l.length).sum()
    }

    /// The single level whose regression range owns `distance`, if any.
    pub fn level_for_distance(&self, distance: f32) -> Option<usize> {
        self.levels
            .iter()
            .find(|l| l.owns_distance(distance))
            .map(|l| l.index)
    }

    /// Per-level validity masks for `valid_len` real input positions.
    ///
    /// A position is valid iff the input position it was strided from is real.
    pub fn level_masks(&self, valid_len: usize) -> Vec<Vec<bool>> {
        self.levels
            .iter()
            .map(|l| (0..l.length).map(|t| t * l.stride < valid_len).collect())
            .collect()
    }
}

// ============================================================================
// INPUT LENGTH POLICY
// ============================================================================

/// How an input sequence of a given length is mapped onto the pyramid grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequencePlan {
    /// Length of the caller's sequence.
    pub original_len: usize,
    /// First original position kept.
    pub window_start: usize,
    /// Number of original positions kept (after truncation).
    pub window_len: usize,
    /// Number of real positions on the grid (after any upsampling).
    pub valid_len: usize,
    /// Padded grid length, always `max_seq_len`.
    pub padded_len: usize,
}

impl SequencePlan {
    /// Whether the window is linearly resampled onto the grid.
    #[inline]
    pub fn is_resampled(&self) -> bool {
        self.valid_len != self.window_len
    }

    /// Original positions per grid position.
    #[inline]
    pub fn time_scale(&self) -> f32 {
        self.window_len as f32 / self.valid_len as f32
    }

    /// Map a grid coordinate back to the caller's feature grid.
    pub fn grid_to_original(&self, pos: f32) -> f32 {
        let local = if self.is_resampled() {
            (pos + 0.5) * self.time_scale() - 0.5
        } else {
            pos
        };
        local + self.window_start as f32
    }

    /// Map a caller coordinate onto the grid (inverse of [`grid_to_original`]).
    ///
    /// [`grid_to_original`]: SequencePlan::grid_to_original
    pub fn original_to_grid(&self, pos: f32) -> f32 {
        let local = pos - self.window_start as f32;
        if self.is_resampled() {
            (local + 0.5) / self.time_scale() - 0.5
        } else {
            local
        }
    }
}

/// Length policy shared by training and inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencePolicy {
    pub max_seq_len: usize,
    /// Minimum length for the coarsest level to hold a real position.
    pub min_len: usize,
    pub force_upsampling: bool,
}

impl SequencePolicy {
    pub fn from_config(model: &ModelConfig, dataset: &DatasetConfig) -> Self {
        Self {
            max_seq_len: dataset.max_seq_len,
            min_len: model.max_div_factor(),
            force_upsampling: dataset.force_upsampling,
        }
    }

    /// Plan for a sequence, keeping the leading window when it is too long.
    pub fn plan(&self, original_len: usize) -> CoreResult<SequencePlan> {
        self.plan_window(original_len, 0)
    }

    /// Plan for a sequence whose kept window starts at `window_start`.
    pub fn plan_window(&self, original_len: usize, window_start: usize) -> CoreResult<SequencePlan> {
        if original_len == 0 {
            return Err(CoreError::shape("feature sequence length", 1, 0));
        }
        if window_start >= original_len {
            return Err(CoreError::config(format!(
                "window start {window_start} is outside a sequence of length {original_len}"
            )));
        }
        let window_len = (original_len - window_start).min(self.max_seq_len);
        let valid_len = if self.force_upsampling && window_len < self.min_len {
            self.min_len
        } else {
            window_len
        };
        Ok(SequencePlan {
            original_len,
            window_start,
            window_len,
            valid_len,
            padded_len: self.max_seq_len,
        })
    }

    /// Ground truths projected onto the grid of `plan`.
    ///
    /// Segments are clipped to the kept window; anything left empty is dropped.
    pub fn project_ground_truth(&self, plan: &SequencePlan, gts: &[GroundTruth]) -> Vec<GroundTruth> {
        let lo = plan.window_start as f32;
        let hi = (plan.window_start + plan.window_len) as f32;
        gts.iter()
            .filter_map(|gt| {
                let start = gt.start.max(lo);
                let end = gt.end.min(hi);
                if end <= start {
                    return None;
                }
                let start = plan.original_to_grid(start);
                let end = plan.original_to_grid(end);
                (end > start).then_some(GroundTruth {
                    start,
                    end,
                    label: gt.label,
                })
            })
            .collect()
    }
}

/// A training crop of a long sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct CropWindow {
    pub start: usize,
    pub end: usize,
    /// Ground truths kept by the crop, relative to `start`.
    pub ground_truth: Vec<GroundTruth>,
}

const MAX_CROP_TRIALS: usize = 200;

/// Pick a training window of a sequence of `feat_len` positions.
///
/// Sequences longer than `max_seq_len` (or every sequence when `crop_ratio`
/// is set) are cropped at a random start. A ground truth survives the crop if
/// at least `trunc_thresh` of it lies inside the window; up to 200 starts are
/// tried to find a window keeping at least one action. Returns `None` when the
/// sequence is used as is.
pub fn truncate_window<R: Rng + ?Sized>(
    feat_len: usize,
    gts: &[GroundTruth],
    max_seq_len: usize,
    trunc_thresh: f32,
    crop_ratio: Option<[f32; 2]>,
    rng: &mut R,
) -> Option<CropWindow> {
    let mut window_len = max_seq_len;
    if feat_len <= max_seq_len {
        let [lo, hi] = crop_ratio?;
        let min_len = ((lo * feat_len as f32).round() as usize).max(1);
        let max_len = ((hi * feat_len as f32).round() as usize).min(feat_len);
        window_len = rng.gen_range(min_len.min(max_len)..=max_len);
        if window_len == feat_len {
            return None;
        }
    }

    let mut start = 0;
    let mut kept: Vec<GroundTruth> = Vec::new();
    for _ in 0..MAX_CROP_TRIALS {
        start = rng.gen_range(0..=feat_len - window_len);
        let end = (start + window_len) as f32;
        kept = gts
            .iter()
            .filter_map(|gt| {
                let left = gt.start.max(start as f32);
                let right = gt.end.min(end);
                let inter = (right - left).max(0.0);
                (inter / gt.length() >= trunc_thresh).then_some(GroundTruth {
                    start: left - start as f32,
                    end: right - start as f32,
                    label: gt.label,
                })
            })
            .collect();
        if !kept.is_empty() || gts.is_empty() {
            break;
        }
    }

    Some(CropWindow {
        start,
        end: start + window_len,
        ground_truth: kept,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> ExperimentConfig {
        ExperimentConfig::from_yaml_str(include_str!("../tests/fixtures/tiny.yaml")).unwrap()
    }

    #[test]
    fn test_layout_lengths_and_strides() {
        let config = tiny();
        let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
        assert_eq!(layout.num_levels(), 4);
        let lengths: Vec<usize> = layout.levels().iter().map(|l| l.length).collect();
        let strides: Vec<usize> = layout.levels().iter().map(|l| l.stride).collect();
        assert_eq!(lengths, vec![64, 32, 16, 8]);
        assert_eq!(strides, vec![1, 2, 4, 8]);
        assert_eq!(layout.total_positions(), 120);
        assert_eq!(layout.level(2).unwrap().offset, 96);
    }

    #[test]
    fn test_each_distance_owned_by_one_level() {
        let config = tiny();
        let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
        for d in [0.0f32, 3.99, 4.0, 7.5, 8.0, 15.9, 16.0, 500.0] {
            let owners = layout.levels().iter().filter(|l| l.owns_distance(d)).count();
            assert_eq!(owners, 1, "distance {d} owned by {owners} levels");
        }
        assert_eq!(layout.level_for_distance(4.0), Some(1));
        assert_eq!(layout.level_for_distance(3.999), Some(0));
    }

    #[test]
    fn test_floor_lengths_for_odd_input() {
        let config = tiny();
        let layout = PyramidLayout::new(&config.model, 45).unwrap();
        let lengths: Vec<usize> = layout.levels().iter().map(|l| l.length).collect();
        assert_eq!(lengths, vec![45, 22, 11, 5]);
    }

    #[test]
    fn test_level_masks() {
        let config = tiny();
        let layout = PyramidLayout::from_config(&config.model, &config.dataset).unwrap();
        let masks = layout.level_masks(10);
        assert_eq!(masks[0].iter().filter(|&&m| m).count(), 10);
        assert_eq!(masks[1].iter().filter(|&&m| m).count(), 5);
        assert_eq!(masks[3].iter().filter(|&&m| m).count(), 2);
    }

    #[test]
    fn test_plan_upsamples_short_sequences() {
        let config = tiny();
        let policy = SequencePolicy::from_config(&config.model, &config.dataset);
        assert_eq!(policy.min_len, 8);
        let plan = policy.plan(5).unwrap();
        assert_eq!(plan.valid_len, 8);
        assert_eq!(plan.padded_len, 64);
        assert!(plan.is_resampled());
        let back = plan.grid_to_original(plan.original_to_grid(3.0));
        assert!((back - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_plan_without_upsampling_keeps_length() {
        let config = tiny();
        let mut policy = SequencePolicy::from_config(&config.model, &config.dataset);
        policy.force_upsampling = false;
        let plan = policy.plan(5).unwrap();
        assert_eq!(plan.valid_len, 5);
        assert!(!plan.is_resampled());
    }

    #[test]
    fn test_plan_truncates_long_sequences() {
        let config = tiny();
        let policy = SequencePolicy::from_config(&config.model, &config.dataset);
        let plan = policy.plan(100).unwrap();
        assert_eq!(plan.window_len, 64);
        assert_eq!(plan.valid_len, 64);
        assert!(policy.plan(0).is_err());
    }

    #[test]
    fn test_project_ground_truth_clips_to_window() {
        let config = tiny();
        let policy = SequencePolicy::from_config(&config.model, &config.dataset);
        let plan = policy.plan_window(100, 20).unwrap();
        let gts = vec![
            GroundTruth::new(10.0, 30.0, 0).unwrap(),
            GroundTruth::new(90.0, 99.0, 1).unwrap(),
            GroundTruth::new(0.0, 5.0, 2).unwrap(),
        ];
        let projected = policy.project_ground_truth(&plan, &gts);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].start, 0.0);
        assert_eq!(projected[0].end, 10.0);
    }

    #[test]
    fn test_truncate_window_keeps_actions() {
        let mut rng = StdRng::seed_from_u64(7);
        let gts = vec![GroundTruth::new(150.0, 170.0, 1).unwrap()];
        let crop = truncate_window(200, &gts, 64, 0.5, None, &mut rng).unwrap();
        assert_eq!(crop.end - crop.start, 64);
        assert_eq!(crop.ground_truth.len(), 1);
        let gt = crop.ground_truth[0];
        assert!(gt.start >= 0.0 && gt.end <= 64.0);
    }

    #[test]
    fn test_truncate_window_short_sequence_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        assert!(truncate_window(50, &[], 64, 0.5, None, &mut rng).is_none());
    }

    #[test]
    fn test_truncate_window_is_seeded() {
        let gts = vec![GroundTruth::new(10.0, 190.0, 0).unwrap()];
        let a = truncate_window(500, &gts, 64, 0.1, None, &mut StdRng::seed_from_u64(3));
        let b = truncate_window(500, &gts, 64, 0.1, None, &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
