//! Section structs of the experiment configuration.
//!
//! Every struct rejects unknown keys and no field carries a serde default:
//! a key that is absent from the document is a load error. Nullable keys use
//! [`nullable`] so that they must still be written out explicitly as `null`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Deserializer for `Option<T>` fields that must be present in the document.
///
/// With a plain `Option<T>` serde quietly fills in `None` for a missing key;
/// routing through `deserialize_with` turns the missing key into an error
/// while still accepting an explicit `null`.
pub(crate) mod nullable {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer)
    }
}

// ============================================================================
// NAMED OPTIONS
// ============================================================================

/// How multi-modality features arrive from the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One tensor with all modalities already concatenated along channels.
    Concat,
    /// One tensor per modality; concatenated by the core before projection.
    Separate,
}

/// Block type used by the backbone stem and branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackboneType {
    #[serde(rename = "conv")]
    Conv,
    #[serde(rename = "convTransformer")]
    ConvTransformer,
}

/// Neck applied on top of the backbone pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpnType {
    Identity,
    Fpn,
}

/// Positive-sample selection rule during label assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CenterSample {
    /// Only positions within `center_sample_radius * stride` of the segment center.
    Radius,
    /// Any position strictly inside the segment.
    None,
}

/// Suppression rule of the NMS decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NmsMethod {
    Soft,
    Hard,
    None,
}

/// Continual-learning regularizer variant (`cl_cfg.name`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegularizerKind {
    /// Memory-aware synapses: label-free output-sensitivity importance.
    Mas,
    /// Elastic weight consolidation: importance from the detection loss.
    Ewc,
}

/// Exemplar selection strategy for the replay buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingStrategy {
    /// Herding toward the class-mean embedding.
    Icarl,
    /// Seeded uniform sampling.
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerType {
    #[serde(rename = "AdamW")]
    AdamW,
    #[serde(rename = "SGD")]
    Sgd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cosine,
    Multistep,
}

// ============================================================================
// DATASET
// ============================================================================

/// Shape of the features handed to the core by the (external) loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Temporal stride of the features, in frames.
    pub feat_stride: u32,
    /// Number of frames covered by each feature.
    pub num_frames: u32,
    /// Frames per second; `null` means the loader supplies it per video.
    #[serde(deserialize_with = "nullable::deserialize")]
    pub default_fps: Option<f32>,
    /// Raw feature channel width.
    pub input_dim: usize,
    pub num_classes: usize,
    pub downsample_rate: usize,
    /// Fixed sequence length the pyramid is built on.
    pub max_seq_len: usize,
    /// Minimum fraction of an action kept inside a training crop.
    pub trunc_thresh: f32,
    /// Random crop length range as fractions of the sequence, or `null`.
    #[serde(deserialize_with = "nullable::deserialize")]
    pub crop_ratio: Option<[f32; 2]>,
    /// Upsample short sequences so every pyramid level holds real positions.
    pub force_upsampling: bool,
    pub output_format: OutputFormat,
}

impl DatasetConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.feat_stride == 0 {
            return Err(CoreError::config("dataset.feat_stride must be greater than 0"));
        }
        if self.num_frames == 0 {
            return Err(CoreError::config("dataset.num_frames must be greater than 0"));
        }
        if let Some(fps) = self.default_fps {
            if !(fps > 0.0) {
                return Err(CoreError::config(format!(
                    "dataset.default_fps must be positive, got {fps}"
                )));
            }
        }
        if self.input_dim == 0 {
            return Err(CoreError::config("dataset.input_dim must be greater than 0"));
        }
        if self.num_classes == 0 {
            return Err(CoreError::config("dataset.num_classes must be greater than 0"));
        }
        if self.downsample_rate == 0 {
            return Err(CoreError::config("dataset.downsample_rate must be greater than 0"));
        }
        if self.max_seq_len == 0 {
            return Err(CoreError::config("dataset.max_seq_len must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.trunc_thresh) {
            return Err(CoreError::config(format!(
                "dataset.trunc_thresh must be in [0, 1], got {}",
                self.trunc_thresh
            )));
        }
        if let Some([lo, hi]) = self.crop_ratio {
            if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
                return Err(CoreError::config(format!(
                    "dataset.crop_ratio must satisfy 0 < lo <= hi <= 1, got [{lo}, {hi}]"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// LOADER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub num_workers: usize,
}

impl LoaderConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 {
            return Err(CoreError::config("loader.batch_size must be greater than 0"));
        }
        Ok(())
    }
}

// ============================================================================
// MODEL
// ============================================================================

/// Network architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub backbone_type: BackboneType,
    pub fpn_type: FpnType,
    /// `[embedding convs, stem blocks, branch (downsampling) blocks]`.
    pub backbone_arch: [usize; 3],
    /// Temporal downsampling factor between consecutive levels.
    pub scale_factor: usize,
    /// `[min, max)` regression distance per pyramid level.
    pub regression_range: Vec<[f32; 2]>,
    pub n_head: usize,
    /// Local attention window; `<= 1` means global attention.
    pub n_mha_win_size: i64,
    pub embd_kernel_size: usize,
    pub embd_dim: usize,
    pub embd_with_ln: bool,
    pub fpn_dim: usize,
    pub fpn_with_ln: bool,
    pub fpn_start_level: usize,
    pub head_dim: usize,
    pub head_kernel_size: usize,
    /// Layers per head including the prediction layer.
    pub head_num_layers: usize,
    pub head_with_ln: bool,
    pub use_abs_pe: bool,
    pub use_cross_modal: bool,
    /// Text embedding width.
    pub n_txt_in: usize,
}

impl ModelConfig {
    /// Number of pyramid levels produced by the backbone.
    pub fn num_levels(&self) -> usize {
        self.backbone_arch[2] + 1
    }

    /// Smallest sequence length that yields a non-empty coarsest level.
    pub fn max_div_factor(&self) -> usize {
        self.scale_factor.pow((self.num_levels() - 1) as u32)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.scale_factor < 2 {
            return Err(CoreError::config(format!(
                "model.scale_factor must be at least 2, got {}",
                self.scale_factor
            )));
        }
        let levels = self.num_levels();
        if self.regression_range.len() != levels {
            return Err(CoreError::config(format!(
                "model.regression_range has {} entries but backbone_arch {:?} builds {} pyramid levels",
                self.regression_range.len(),
                self.backbone_arch,
                levels
            )));
        }
        for (i, [lo, hi]) in self.regression_range.iter().enumerate() {
            if !(lo < hi) || *lo < 0.0 {
                return Err(CoreError::config(format!(
                    "model.regression_range[{i}] = [{lo}, {hi}] must satisfy 0 <= min < max"
                )));
            }
            if let Some([next_lo, _]) = self.regression_range.get(i + 1) {
                if (hi - next_lo).abs() > f32::EPSILON {
                    return Err(CoreError::config(format!(
                        "model.regression_range[{i}] ends at {hi} but level {} starts at {next_lo}; ranges must be adjacent",
                        i + 1
                    )));
                }
            }
        }
        if self.fpn_start_level != 0 {
            return Err(CoreError::config(format!(
                "model.fpn_start_level must be 0 so every level has a regression range, got {}",
                self.fpn_start_level
            )));
        }
        for (name, value) in [
            ("embd_dim", self.embd_dim),
            ("fpn_dim", self.fpn_dim),
            ("head_dim", self.head_dim),
            ("n_head", self.n_head),
            ("head_num_layers", self.head_num_layers),
        ] {
            if value == 0 {
                return Err(CoreError::config(format!("model.{name} must be greater than 0")));
            }
        }
        for (name, value) in [
            ("embd_kernel_size", self.embd_kernel_size),
            ("head_kernel_size", self.head_kernel_size),
        ] {
            if value % 2 == 0 {
                return Err(CoreError::config(format!(
                    "model.{name} must be odd to preserve temporal length, got {value}"
                )));
            }
        }
        if self.backbone_type == BackboneType::ConvTransformer && self.embd_dim % self.n_head != 0 {
            return Err(CoreError::config(format!(
                "model.embd_dim ({}) must be divisible by n_head ({})",
                self.embd_dim, self.n_head
            )));
        }
        if self.use_cross_modal {
            if self.n_txt_in == 0 {
                return Err(CoreError::config(
                    "model.n_txt_in must be greater than 0 when use_cross_modal is set",
                ));
            }
            if self.fpn_dim % self.n_head != 0 {
                return Err(CoreError::config(format!(
                    "model.fpn_dim ({}) must be divisible by n_head ({}) for cross-modal fusion",
                    self.fpn_dim, self.n_head
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TRAINING
// ============================================================================

/// Label assignment and loss settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub center_sample: CenterSample,
    pub center_sample_radius: f32,
    /// Regression loss weight; `<= 0` enables automatic balancing.
    pub loss_weight: f32,
    pub cls_prior_prob: f32,
    pub init_loss_norm: f32,
    /// Global gradient L2 clip; `<= 0` disables clipping.
    pub clip_grad_l2norm: f32,
    /// Classes without training data; their logits are biased toward zero.
    pub head_empty_cls: Vec<usize>,
    pub dropout: f32,
    pub droppath: f32,
    pub label_smoothing: f32,
    /// EMA coefficient of the loss normalizer.
    pub t_c_alpha: f32,
    pub al_loss_weight: f32,
    pub cont_loss_weight: f32,
    pub seg_loss_weight: f32,
    /// Softmax temperature of the contrastive loss.
    pub temperature: f32,
}

impl TrainConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.center_sample == CenterSample::Radius && !(self.center_sample_radius > 0.0) {
            return Err(CoreError::config(format!(
                "train_cfg.center_sample_radius must be positive, got {}",
                self.center_sample_radius
            )));
        }
        if !(self.cls_prior_prob > 0.0 && self.cls_prior_prob < 1.0) {
            return Err(CoreError::config(format!(
                "train_cfg.cls_prior_prob must be in (0, 1), got {}",
                self.cls_prior_prob
            )));
        }
        if !(self.init_loss_norm > 0.0) {
            return Err(CoreError::config("train_cfg.init_loss_norm must be positive"));
        }
        if !(0.0..1.0).contains(&self.t_c_alpha) {
            return Err(CoreError::config(format!(
                "train_cfg.t_c_alpha must be in [0, 1), got {}",
                self.t_c_alpha
            )));
        }
        for (name, value) in [
            ("dropout", self.dropout),
            ("droppath", self.droppath),
            ("label_smoothing", self.label_smoothing),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(CoreError::config(format!(
                    "train_cfg.{name} must be in [0, 1), got {value}"
                )));
            }
        }
        for (name, value) in [
            ("al_loss_weight", self.al_loss_weight),
            ("cont_loss_weight", self.cont_loss_weight),
            ("seg_loss_weight", self.seg_loss_weight),
        ] {
            if !(value >= 0.0) {
                return Err(CoreError::config(format!(
                    "train_cfg.{name} must be non-negative, got {value}"
                )));
            }
        }
        if !(self.temperature > 0.0) {
            return Err(CoreError::config("train_cfg.temperature must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// INFERENCE
// ============================================================================

/// NMS decoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestConfig {
    pub pre_nms_topk: usize,
    pub min_score: f32,
    pub max_seg_num: usize,
    pub nms_method: NmsMethod,
    pub nms_sigma: f32,
    /// Minimum kept segment duration in seconds (inclusive).
    pub duration_thresh: f32,
    pub multiclass_nms: bool,
    /// IoU above which an overlapping candidate is suppressed or decayed.
    pub iou_threshold: f32,
    /// Boundary voting after suppression: every kept segment takes the
    /// score-weighted mean boundaries of the candidates overlapping it by at
    /// least this IoU. `0` disables voting.
    pub voting_thresh: f32,
}

impl TestConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.pre_nms_topk == 0 {
            return Err(CoreError::config("test_cfg.pre_nms_topk must be positive"));
        }
        if self.max_seg_num == 0 {
            return Err(CoreError::config("test_cfg.max_seg_num must be positive"));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(CoreError::config(format!(
                "test_cfg.min_score must be in [0, 1], got {}",
                self.min_score
            )));
        }
        if self.nms_method == NmsMethod::Soft && !(self.nms_sigma > 0.0) {
            return Err(CoreError::config("test_cfg.nms_sigma must be positive for soft NMS"));
        }
        if !(self.duration_thresh >= 0.0) {
            return Err(CoreError::config("test_cfg.duration_thresh must be non-negative"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(CoreError::config(format!(
                "test_cfg.iou_threshold must be in [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.voting_thresh) {
            return Err(CoreError::config(format!(
                "test_cfg.voting_thresh must be in [0, 1], got {}",
                self.voting_thresh
            )));
        }
        Ok(())
    }
}

// ============================================================================
// CONTINUAL LEARNING
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContinualConfig {
    /// Regularizer variant; `null` trains without a drift penalty.
    #[serde(deserialize_with = "nullable::deserialize")]
    pub name: Option<RegularizerKind>,
    /// Replay exemplars kept across tasks; 0 disables replay.
    pub memory_size: usize,
    /// Task/class-group manifest.
    pub pkl_file: PathBuf,
    pub random_order: bool,
    pub reg_lambda: f32,
    pub type_sampling: SamplingStrategy,
}

impl ContinualConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.reg_lambda >= 0.0) || !self.reg_lambda.is_finite() {
            return Err(CoreError::config(format!(
                "cl_cfg.reg_lambda must be finite and non-negative, got {}",
                self.reg_lambda
            )));
        }
        if self.pkl_file.as_os_str().is_empty() {
            return Err(CoreError::config("cl_cfg.pkl_file cannot be empty"));
        }
        Ok(())
    }
}

// ============================================================================
// OPTIMIZER
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: OptimizerType,
    pub momentum: f64,
    pub weight_decay: f64,
    pub learning_rate: f64,
    /// Epochs after warmup.
    pub epochs: usize,
    pub warmup: bool,
    pub warmup_epochs: usize,
    pub schedule_type: ScheduleType,
    /// Multistep milestones, in epochs after warmup.
    pub schedule_steps: Vec<usize>,
    pub schedule_gamma: f64,
}

impl OptimizerConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.learning_rate > 0.0) {
            return Err(CoreError::config("opt.learning_rate must be positive"));
        }
        if self.epochs == 0 {
            return Err(CoreError::config("opt.epochs must be greater than 0"));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(CoreError::config("opt.weight_decay must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(CoreError::config("opt.momentum must be in [0, 1)"));
        }
        if self.schedule_type == ScheduleType::Multistep {
            if self.schedule_steps.windows(2).any(|w| w[0] >= w[1]) {
                return Err(CoreError::config(
                    "opt.schedule_steps must be strictly increasing",
                ));
            }
            if !(self.schedule_gamma > 0.0 && self.schedule_gamma <= 1.0) {
                return Err(CoreError::config("opt.schedule_gamma must be in (0, 1]"));
            }
        }
        Ok(())
    }
}
