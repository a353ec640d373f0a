//! egoloc Core Library
//!
//! Tensor-free building blocks of the text-conditioned temporal action
//! localizer: everything that can be expressed on plain vectors lives here so
//! it can be tested without a model.
//!
//! # Architecture
//!
//! This crate defines:
//! - The experiment configuration schema, loading and validation (`config`)
//! - Error types and result aliases (`error`)
//! - Feature pyramid geometry and the input length policy (`pyramid`)
//! - Label assignment of ground truths to pyramid positions (`assign`)
//! - The multi-class NMS decoder (`nms`)
//! - Continual task ordering and exemplar replay (`continual`)
//! - The learning-rate schedule (`schedule`)
//!
//! # Example
//!
//! ```
//! use egoloc_core::config::TestConfig;
//! use egoloc_core::config::NmsMethod;
//! use egoloc_core::nms::NmsDecoder;
//!
//! let test_cfg = TestConfig {
//!     pre_nms_topk: 0,
//!     min_score: 0.001,
//!     max_seg_num: 200,
//!     nms_method: NmsMethod::Soft,
//!     nms_sigma: 0.5,
//!     duration_thresh: 0.05,
//!     multiclass_nms: true,
//!     iou_threshold: 0.1,
//!     voting_thresh: 0.75,
//! };
//! // a decoder that can never emit anything is a configuration error
//! assert!(NmsDecoder::new(&test_cfg, 110).is_err());
//! ```

pub mod assign;
pub mod config;
pub mod continual;
pub mod error;
pub mod nms;
pub mod pyramid;
pub mod schedule;
pub mod types;

// Re-exports for convenience
pub use assign::{AssignedTargets, LabelAssigner};
pub use config::ExperimentConfig;
pub use error::{CoreError, CoreResult};
pub use nms::{LevelPrediction, NmsDecoder};
pub use pyramid::{LevelDescriptor, PyramidLayout, SequencePlan, SequencePolicy};
pub use types::{GroundTruth, Segment, VideoMeta};
