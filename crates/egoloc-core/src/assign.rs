//! Label assignment.
//!
//! Maps ground-truth segments onto every candidate position of the pyramid.
//! A position is positive for a ground truth when it lies inside the (possibly
//! center-sampled) segment and its larger boundary distance falls in the
//! regression range of the position's level. Assignment is a pure function of
//! the layout and the ground truth.

use serde::{Deserialize, Serialize};

use crate::config::{CenterSample, TrainConfig};
use crate::error::{CoreError, CoreResult};
use crate::pyramid::PyramidLayout;
use crate::types::GroundTruth;

/// Ground truths whose length is within this of the shortest are co-assigned.
const LENGTH_TIE_EPS: f32 = 1e-3;

/// Targets for every position of the pyramid, flattened level after level in
/// [`PyramidLayout`] offset order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignedTargets {
    pub num_classes: usize,
    /// `[total_positions * num_classes]` row-major multi-hot labels.
    pub cls: Vec<f32>,
    /// Boundary distances of the assigned segment, in units of the level stride.
    pub reg: Vec<[f32; 2]>,
    pub positive: Vec<bool>,
}

impl AssignedTargets {
    fn empty(total: usize, num_classes: usize) -> Self {
        Self {
            num_classes,
            cls: vec![0.0; total * num_classes],
            reg: vec![[0.0; 2]; total],
            positive: vec![false; total],
        }
    }

    pub fn num_positions(&self) -> usize {
        self.positive.len()
    }

    pub fn num_pos(&self) -> usize {
        self.positive.iter().filter(|&&p| p).count()
    }

    /// Label row of one flattened position.
    pub fn labels_at(&self, position: usize) -> &[f32] {
        let start = position * self.num_classes;
        &self.cls[start..start + self.num_classes]
    }
}

/// Assigns ground truths to pyramid positions.
#[derive(Debug, Clone)]
pub struct LabelAssigner {
    layout: PyramidLayout,
    num_classes: usize,
    center_sample: CenterSample,
    radius: f32,
}

impl LabelAssigner {
    pub fn new(layout: PyramidLayout, train: &TrainConfig, num_classes: usize) -> Self {
        Self {
            layout,
            num_classes,
            center_sample: train.center_sample,
            radius: train.center_sample_radius,
        }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    /// Compute targets for one sample's ground truth on the grid.
    pub fn assign(&self, gts: &[GroundTruth]) -> CoreResult<AssignedTargets> {
        if let Some(gt) = gts.iter().find(|gt| gt.label >= self.num_classes) {
            return Err(CoreError::TaskSequencing(format!(
                "ground truth label {} is outside the {} known classes",
                gt.label, self.num_classes
            )));
        }

        let mut targets = AssignedTargets::empty(self.layout.total_positions(), self.num_classes);
        if gts.is_empty() {
            return Ok(targets);
        }

        let mut eligible: Vec<usize> = Vec::with_capacity(gts.len());
        for level in self.layout.levels() {
            let stride = level.stride as f32;
            for t in 0..level.length {
                let pt = level.coordinate(t);
                eligible.clear();
                eligible.extend(
                    gts.iter()
                        .enumerate()
                        .filter(|(_, gt)| self.is_inside(pt, stride, gt))
                        .filter(|(_, gt)| level.owns_distance((pt - gt.start).max(gt.end - pt)))
                        .map(|(i, _)| i),
                );
                let Some(&winner) = eligible
                    .iter()
                    .min_by(|&&a, &&b| gts[a].length().total_cmp(&gts[b].length()))
                else {
                    continue;
                };

                let position = level.offset + t;
                let min_len = gts[winner].length();
                let row = position * self.num_classes;
                for &i in &eligible {
                    if gts[i].length() <= min_len + LENGTH_TIE_EPS {
                        targets.cls[row + gts[i].label] = 1.0;
                    }
                }
                let gt = &gts[winner];
                targets.reg[position] = [(pt - gt.start) / stride, (gt.end - pt) / stride];
                targets.positive[position] = true;
            }
        }
        Ok(targets)
    }

    fn is_inside(&self, pt: f32, stride: f32, gt: &GroundTruth) -> bool {
        match self.center_sample {
            CenterSample::Radius => {
                let center = 0.5 * (gt.start + gt.end);
                let lo = gt.start.max(center - self.radius * stride);
                let hi = gt.end.min(center + self.radius * stride);
                (pt - lo).min(hi - pt) > 0.0
            }
            CenterSample::None => (pt - gt.start).min(gt.end - pt) > 0.0,
        }
    }
}
