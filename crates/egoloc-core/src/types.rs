//! Shared value types.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// A decoded detection, in seconds.
///
/// Invariant: `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f32,
    pub end: f32,
    pub class_id: usize,
    pub score: f32,
}

impl Segment {
    #[inline]
    pub fn duration(&self) -> f32 {
        self.end - self.start
    }
}

/// A ground-truth action on the feature grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub start: f32,
    pub end: f32,
    pub label: usize,
}

impl GroundTruth {
    /// Create a ground truth, rejecting empty or reversed spans.
    pub fn new(start: f32, end: f32, label: usize) -> CoreResult<Self> {
        if !(start.is_finite() && end.is_finite()) || end <= start {
            return Err(CoreError::config(format!(
                "ground truth segment [{start}, {end}] must have start < end"
            )));
        }
        Ok(Self { start, end, label })
    }

    #[inline]
    pub fn length(&self) -> f32 {
        self.end - self.start
    }
}

/// Per-video timing needed to map feature-grid positions to seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoMeta {
    pub fps: f32,
    /// Video duration in seconds.
    pub duration: f32,
    pub feat_stride: u32,
    pub num_frames: u32,
}

impl VideoMeta {
    /// Convert a feature-grid coordinate to seconds.
    ///
    /// Each feature covers `num_frames` frames starting at `pos * feat_stride`,
    /// so its timestamp is the window center.
    #[inline]
    pub fn grid_to_seconds(&self, pos: f32) -> f32 {
        (pos * self.feat_stride as f32 + 0.5 * self.num_frames as f32) / self.fps
    }

    /// Inverse of [`VideoMeta::grid_to_seconds`].
    #[inline]
    pub fn seconds_to_grid(&self, t: f32) -> f32 {
        (t * self.fps - 0.5 * self.num_frames as f32) / self.feat_stride as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_truth_rejects_reversed() {
        assert!(GroundTruth::new(5.0, 5.0, 0).is_err());
        assert!(GroundTruth::new(6.0, 5.0, 0).is_err());
        assert!(GroundTruth::new(f32::NAN, 5.0, 0).is_err());
        assert!(GroundTruth::new(1.0, 5.0, 0).is_ok());
    }

    #[test]
    fn test_grid_seconds_roundtrip() {
        let meta = VideoMeta {
            fps: 30.0,
            duration: 100.0,
            feat_stride: 16,
            num_frames: 32,
        };
        // position 0 is the center of the first 32-frame window
        assert!((meta.grid_to_seconds(0.0) - 16.0 / 30.0).abs() < 1e-6);
        let t = meta.grid_to_seconds(12.5);
        assert!((meta.seconds_to_grid(t) - 12.5).abs() < 1e-4);
    }
}
