//! egoloc Model Library
//!
//! Candle implementation of the text-conditioned temporal action detector and
//! its continual training step.
//!
//! # Architecture
//!
//! - **Backbone / Neck**: multi-scale temporal feature pyramid (`backbone`)
//! - **CrossModalFusion**: conditions every level on the query text (`fusion`)
//! - **DetectionHeads**: classification, regression and auxiliary heads (`heads`)
//! - **Detector**: the assembled network plus NMS-decoded inference (`detector`)
//! - **DetectionLoss**: focal + DIoU loss with auxiliary terms (`loss`)
//! - **ContinualRegularizer**: importance-weighted parameter penalty (`regularizer`)
//! - **Trainer**: one optimizer step and the task lifecycle (`trainer`)
//! - **BatchBuilder**: places variable-length samples on the pyramid grid (`input`)
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use egoloc_core::ExperimentConfig;
//! use egoloc_model::{BatchBuilder, Trainer};
//!
//! let config = ExperimentConfig::from_file("configs/ego4d_mq_incremental.yaml")?;
//! let device = Device::Cpu;
//! let mut trainer = Trainer::new(&config, steps_per_epoch, &device)?;
//! let mut batches = BatchBuilder::new(&config, &device);
//! trainer.begin_task()?;
//! let report = trainer.step(&batches.training_batch(&samples)?)?;
//! ```

pub mod backbone;
pub mod detector;
pub mod error;
pub mod fusion;
pub mod heads;
pub mod input;
pub mod loss;
pub mod ops;
pub mod regularizer;
pub mod trainer;

// Re-exports for convenience
pub use detector::{Detector, DetectorOutput};
pub use error::{ModelError, ModelResult};
pub use input::{BatchBuilder, PreparedBatch, VideoSample};
pub use loss::{DetectionLoss, LossBreakdown};
pub use regularizer::{ContinualRegularizer, ImportanceSnapshot, RegularizerState};
pub use trainer::{OptimizerAdapter, StepReport, Trainer};
