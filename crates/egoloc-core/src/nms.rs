//! Multi-class NMS decoder.
//!
//! Turns per-level class probabilities and boundary offsets into a ranked,
//! deduplicated list of [`Segment`]s in seconds.
//!
//! # Procedure
//!
//! 1. Offsets become absolute boundaries `pt - left*stride`, `pt + right*stride`.
//! 2. Masked positions and scores below `min_score` are dropped.
//! 3. The `pre_nms_topk` best candidates over all levels are kept.
//! 4. Suppression runs per class (in parallel) or jointly, using
//!    `iou_threshold`. With `voting_thresh > 0` every kept segment then takes
//!    the score-weighted mean boundaries of the candidates of its group that
//!    overlap it by at least `voting_thresh`.
//! 5. Boundaries are mapped to seconds, clamped to the video and degenerate
//!    segments dropped, as are segments shorter than `duration_thresh`.
//! 6. Segments are sorted by score and truncated to `max_seg_num`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

use crate::config::{NmsMethod, TestConfig};
use crate::error::{CoreError, CoreResult};
use crate::pyramid::SequencePlan;
use crate::types::{Segment, VideoMeta};

/// Head outputs of one pyramid level for one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelPrediction {
    pub stride: usize,
    /// `[length * num_classes]` row-major class probabilities.
    pub scores: Vec<f32>,
    /// `[length]` boundary distances in units of `stride`.
    pub offsets: Vec<[f32; 2]>,
    /// `[length]` validity of each position.
    pub mask: Vec<bool>,
}

impl LevelPrediction {
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// A segment on the feature grid before the mapping to seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub start: f32,
    pub end: f32,
    pub class_id: usize,
    pub score: f32,
}

impl Candidate {
    pub fn iou(&self, other: &Candidate) -> f32 {
        let inter = (self.end.min(other.end) - self.start.max(other.start)).max(0.0);
        let union = (self.end - self.start) + (other.end - other.start) - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Descending score; ties broken by earlier start, then class, then end.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.start.total_cmp(&b.start))
        .then_with(|| a.class_id.cmp(&b.class_id))
        .then_with(|| a.end.total_cmp(&b.end))
}

fn rank_segments(a: &Segment, b: &Segment) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.start.total_cmp(&b.start))
        .then_with(|| a.class_id.cmp(&b.class_id))
        .then_with(|| a.end.total_cmp(&b.end))
}

/// NMS decoder configured from `test_cfg`.
#[derive(Debug, Clone)]
pub struct NmsDecoder {
    num_classes: usize,
    pre_nms_topk: usize,
    min_score: f32,
    max_seg_num: usize,
    method: NmsMethod,
    sigma: f32,
    iou_threshold: f32,
    voting_thresh: f32,
    duration_thresh: f32,
    multiclass: bool,
    parallel: bool,
}

impl NmsDecoder {
    /// Build a decoder.
    ///
    /// # Errors
    ///
    /// `ConfigError` when `pre_nms_topk` or `max_seg_num` is zero.
    pub fn new(config: &TestConfig, num_classes: usize) -> CoreResult<Self> {
        if config.pre_nms_topk == 0 {
            return Err(CoreError::config("test_cfg.pre_nms_topk must be positive"));
        }
        if config.max_seg_num == 0 {
            return Err(CoreError::config("test_cfg.max_seg_num must be positive"));
        }
        if num_classes == 0 {
            return Err(CoreError::config("NMS decoder needs at least one class"));
        }
        Ok(Self {
            num_classes,
            pre_nms_topk: config.pre_nms_topk,
            min_score: config.min_score,
            max_seg_num: config.max_seg_num,
            method: config.nms_method,
            sigma: config.nms_sigma,
            iou_threshold: config.iou_threshold,
            voting_thresh: config.voting_thresh,
            duration_thresh: config.duration_thresh,
            multiclass: config.multiclass_nms,
            parallel: true,
        })
    }

    /// Run per-class suppression on the rayon pool (default) or sequentially.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Decode one sample.
    ///
    /// `plan` maps grid coordinates back to the caller's feature grid; `meta`
    /// maps those to seconds.
    pub fn decode(
        &self,
        levels: &[LevelPrediction],
        plan: &SequencePlan,
        meta: &VideoMeta,
    ) -> CoreResult<Vec<Segment>> {
        let candidates = self.collect_candidates(levels)?;
        let total = candidates.len();
        let kept = self.suppress(candidates);
        let after_nms = kept.len();

        let mut segments: Vec<Segment> = kept
            .into_iter()
            .filter_map(|c| {
                let start = meta
                    .grid_to_seconds(plan.grid_to_original(c.start))
                    .clamp(0.0, meta.duration);
                let end = meta
                    .grid_to_seconds(plan.grid_to_original(c.end))
                    .clamp(0.0, meta.duration);
                (end > start).then_some(Segment {
                    start,
                    end,
                    class_id: c.class_id,
                    score: c.score,
                })
            })
            .filter(|s| s.duration() >= self.duration_thresh)
            .collect();

        segments.sort_by(rank_segments);
        segments.truncate(self.max_seg_num);

        debug!(
            candidates = total,
            after_nms,
            output = segments.len(),
            method = ?self.method,
            "Decoded segments"
        );
        Ok(segments)
    }

    /// Steps 1 to 3: absolute boundaries, score and mask filter, global top-k.
    fn collect_candidates(&self, levels: &[LevelPrediction]) -> CoreResult<Vec<Candidate>> {
        let mut candidates = Vec::new();
        for (l, level) in levels.iter().enumerate() {
            let len = level.len();
            if level.scores.len() != len * self.num_classes {
                return Err(CoreError::shape(
                    format!("level {l} class scores"),
                    len * self.num_classes,
                    level.scores.len(),
                ));
            }
            if level.mask.len() != len {
                return Err(CoreError::shape(format!("level {l} mask"), len, level.mask.len()));
            }
            let stride = level.stride as f32;
            for t in 0..len {
                if !level.mask[t] {
                    continue;
                }
                let pt = (t * level.stride) as f32;
                let [left, right] = level.offsets[t];
                let row = &level.scores[t * self.num_classes..(t + 1) * self.num_classes];
                for (class_id, &score) in row.iter().enumerate() {
                    if !(score >= self.min_score) {
                        continue;
                    }
                    candidates.push(Candidate {
                        start: pt - left * stride,
                        end: pt + right * stride,
                        class_id,
                        score,
                    });
                }
            }
        }
        // stable: equal scores keep level/position/class order
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.pre_nms_topk);
        Ok(candidates)
    }

    /// Step 4: suppression and boundary voting, per class or joint. Output is
    /// ranked.
    pub fn suppress(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut kept = if self.multiclass {
            let mut groups: BTreeMap<usize, Vec<Candidate>> = BTreeMap::new();
            for c in candidates {
                groups.entry(c.class_id).or_default().push(c);
            }
            let groups: Vec<Vec<Candidate>> = groups.into_values().collect();
            let per_class: Vec<Vec<Candidate>> = if self.parallel {
                groups.into_par_iter().map(|g| self.suppress_group(g)).collect()
            } else {
                groups.into_iter().map(|g| self.suppress_group(g)).collect()
            };
            per_class.into_iter().flatten().collect::<Vec<_>>()
        } else {
            self.suppress_group(candidates)
        };
        kept.sort_by(rank);
        kept
    }

    fn suppress_group(&self, mut group: Vec<Candidate>) -> Vec<Candidate> {
        group.sort_by(rank);
        if self.voting_thresh > 0.0 {
            let pool = group.clone();
            let mut kept = self.suppress_sorted(group);
            for k in kept.iter_mut() {
                vote(k, &pool, self.voting_thresh);
            }
            kept
        } else {
            self.suppress_sorted(group)
        }
    }

    fn suppress_sorted(&self, group: Vec<Candidate>) -> Vec<Candidate> {
        match self.method {
            NmsMethod::None => group,
            NmsMethod::Hard => {
                let mut kept: Vec<Candidate> = Vec::with_capacity(group.len());
                for c in group {
                    if kept.iter().all(|k| k.iou(&c) <= self.iou_threshold) {
                        kept.push(c);
                    }
                }
                kept
            }
            NmsMethod::Soft => {
                let mut kept = Vec::with_capacity(group.len());
                let mut remaining = group;
                while !remaining.is_empty() {
                    let best = remaining.remove(0);
                    for c in remaining.iter_mut() {
                        let iou = best.iou(c);
                        if iou > self.iou_threshold {
                            c.score *= (-(iou * iou) / self.sigma).exp();
                        }
                    }
                    remaining.retain(|c| c.score >= self.min_score);
                    remaining.sort_by(rank);
                    kept.push(best);
                }
                kept
            }
        }
    }
}

/// Replace the boundaries of `kept` by the score-weighted mean over the
/// candidates of `pool` overlapping it by at least `thresh`. The score stays.
fn vote(kept: &mut Candidate, pool: &[Candidate], thresh: f32) {
    let (mut start, mut end, mut weight) = (0f32, 0f32, 0f32);
    for c in pool.iter().filter(|c| kept.iou(c) >= thresh) {
        start += c.score * c.start;
        end += c.score * c.end;
        weight += c.score;
    }
    if weight > 0.0 {
        kept.start = start / weight;
        kept.end = end / weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(method: NmsMethod, multiclass: bool) -> TestConfig {
        TestConfig {
            pre_nms_topk: 100,
            min_score: 0.01,
            max_seg_num: 10,
            nms_method: method,
            nms_sigma: 0.5,
            duration_thresh: 0.0,
            multiclass_nms: multiclass,
            iou_threshold: 0.5,
            voting_thresh: 0.0,
        }
    }

    fn identity_plan(len: usize) -> SequencePlan {
        SequencePlan {
            original_len: len,
            window_start: 0,
            window_len: len,
            valid_len: len,
            padded_len: len,
        }
    }

    // one grid unit per second, feature centered on its position
    fn unit_meta(duration: f32) -> VideoMeta {
        VideoMeta {
            fps: 1.0,
            duration,
            feat_stride: 1,
            num_frames: 0,
        }
    }

    fn cand(start: f32, end: f32, class_id: usize, score: f32) -> Candidate {
        Candidate {
            start,
            end,
            class_id,
            score,
        }
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut cfg = config(NmsMethod::Hard, true);
        cfg.pre_nms_topk = 0;
        assert!(NmsDecoder::new(&cfg, 2).is_err());
        let mut cfg = config(NmsMethod::Hard, true);
        cfg.max_seg_num = 0;
        assert!(matches!(NmsDecoder::new(&cfg, 2), Err(CoreError::ConfigError(_))));
    }

    #[test]
    fn test_iou() {
        let a = cand(0.0, 10.0, 0, 1.0);
        assert!((a.iou(&cand(5.0, 15.0, 0, 1.0)) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&cand(10.0, 20.0, 0, 1.0)), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_hard_nms_multiclass_keeps_other_classes() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, true), 2).unwrap();
        let kept = decoder.suppress(vec![
            cand(0.0, 10.0, 0, 0.9),
            cand(1.0, 10.0, 0, 0.8),
            cand(0.0, 10.0, 1, 0.7),
        ]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].class_id, 1);
    }

    #[test]
    fn test_hard_nms_joint_suppresses_across_classes() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, false), 2).unwrap();
        let kept = decoder.suppress(vec![
            cand(0.0, 10.0, 0, 0.9),
            cand(1.0, 10.0, 0, 0.8),
            cand(0.0, 10.0, 1, 0.7),
        ]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_soft_nms_decays_overlaps() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Soft, true), 1).unwrap();
        let kept = decoder.suppress(vec![
            cand(0.0, 10.0, 0, 0.9),
            cand(1.0, 10.0, 0, 0.8),
            cand(20.0, 30.0, 0, 0.5),
        ]);
        assert_eq!(kept.len(), 3);
        let decayed = kept.iter().find(|c| c.start == 1.0).unwrap();
        let expected = 0.8 * (-(0.81f32) / 0.5).exp();
        assert!((decayed.score - expected).abs() < 1e-6);
        assert_eq!(kept.iter().find(|c| c.start == 20.0).unwrap().score, 0.5);
    }

    #[test]
    fn test_no_nms_keeps_everything() {
        let decoder = NmsDecoder::new(&config(NmsMethod::None, true), 1).unwrap();
        let kept = decoder.suppress(vec![cand(0.0, 10.0, 0, 0.9), cand(0.0, 10.0, 0, 0.8)]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_decode_ties_broken_by_start() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, true), 1).unwrap();
        let level = LevelPrediction {
            stride: 1,
            scores: vec![0.0, 0.5, 0.0, 0.5, 0.0, 0.0],
            offsets: vec![[0.5, 0.5]; 6],
            mask: vec![true; 6],
        };
        let out = decoder
            .decode(&[level], &identity_plan(6), &unit_meta(6.0))
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].start < out[1].start);
        assert_eq!(out[0].start, 0.5);
    }

    #[test]
    fn test_decode_respects_mask_and_min_score() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, true), 1).unwrap();
        let level = LevelPrediction {
            stride: 1,
            scores: vec![0.9, 0.005, 0.9],
            offsets: vec![[0.5, 0.5]; 3],
            mask: vec![true, true, false],
        };
        let out = decoder
            .decode(&[level], &identity_plan(3), &unit_meta(3.0))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn test_duration_threshold_is_inclusive() {
        let mut cfg = config(NmsMethod::None, true);
        cfg.duration_thresh = 2.0;
        let decoder = NmsDecoder::new(&cfg, 1).unwrap();
        let level = LevelPrediction {
            stride: 1,
            scores: vec![0.9, 0.8, 0.0, 0.0],
            // first lasts exactly 2s, second 1s
            offsets: vec![[0.0, 2.0], [0.5, 0.5], [0.0, 0.0], [0.0, 0.0]],
            mask: vec![true; 4],
        };
        let out = decoder
            .decode(&[level], &identity_plan(4), &unit_meta(4.0))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].duration(), 2.0);
    }

    #[test]
    fn test_decode_clamps_to_video() {
        let decoder = NmsDecoder::new(&config(NmsMethod::None, true), 1).unwrap();
        let level = LevelPrediction {
            stride: 2,
            scores: vec![0.9, 0.8],
            offsets: vec![[3.0, 1.0], [1.0, 5.0]],
            mask: vec![true; 2],
        };
        let out = decoder
            .decode(&[level], &identity_plan(4), &unit_meta(4.0))
            .unwrap();
        assert!(out.iter().all(|s| s.start >= 0.0 && s.end <= 4.0));
        assert_eq!(out[0].start, 0.0);
        assert_eq!(out[1].end, 4.0);
    }

    #[test]
    fn test_shape_mismatch_reported() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, true), 2).unwrap();
        let level = LevelPrediction {
            stride: 1,
            scores: vec![0.9; 3],
            offsets: vec![[0.5, 0.5]; 2],
            mask: vec![true; 2],
        };
        let err = decoder
            .decode(&[level], &identity_plan(2), &unit_meta(2.0))
            .unwrap_err();
        assert!(matches!(err, CoreError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_max_seg_num_truncates() {
        let mut cfg = config(NmsMethod::None, true);
        cfg.max_seg_num = 3;
        let decoder = NmsDecoder::new(&cfg, 1).unwrap();
        let level = LevelPrediction {
            stride: 1,
            scores: (0..8).map(|i| 0.1 + i as f32 * 0.1).collect(),
            offsets: vec![[0.5, 0.5]; 8],
            mask: vec![true; 8],
        };
        let out = decoder
            .decode(&[level], &identity_plan(8), &unit_meta(8.0))
            .unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_voting_refines_boundaries_to_weighted_mean() {
        let mut cfg = config(NmsMethod::Hard, true);
        cfg.voting_thresh = 0.6;
        let decoder = NmsDecoder::new(&cfg, 2).unwrap();
        let kept = decoder.suppress(vec![
            cand(0.0, 10.0, 0, 0.6),
            cand(2.0, 10.0, 0, 0.3),
            // iou 1/3 with the best: survives suppression and does not vote for it
            cand(5.0, 15.0, 0, 0.1),
            // other class: never votes for class 0
            cand(1.0, 9.0, 1, 0.9),
        ]);
        assert_eq!(kept.len(), 3);
        let best = kept.iter().find(|c| c.class_id == 0 && c.score == 0.6).unwrap();
        // (0.6 * 0 + 0.3 * 2) / 0.9 and (0.6 * 10 + 0.3 * 10) / 0.9
        assert!((best.start - 2.0 / 3.0).abs() < 1e-5);
        assert!((best.end - 10.0).abs() < 1e-5);
        let other = kept.iter().find(|c| c.class_id == 1).unwrap();
        assert_eq!((other.start, other.end), (1.0, 9.0));
    }

    #[test]
    fn test_voting_disabled_keeps_boundaries() {
        let decoder = NmsDecoder::new(&config(NmsMethod::Hard, true), 1).unwrap();
        let kept = decoder.suppress(vec![cand(0.0, 10.0, 0, 0.6), cand(2.0, 10.0, 0, 0.3)]);
        assert_eq!(kept.len(), 1);
        assert_eq!((kept[0].start, kept[0].end), (0.0, 10.0));
    }
}
