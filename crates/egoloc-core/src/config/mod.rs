//! Experiment configuration.
//!
//! The configuration document is loaded once at process start and consumed
//! verbatim as typed parameters.
//!
//! # Loading
//!
//! ```rust,ignore
//! use egoloc_core::config::ExperimentConfig;
//!
//! let config = ExperimentConfig::from_file("configs/ego4d_mq_incremental.yaml")?;
//! assert_eq!(config.model.num_levels(), config.model.regression_range.len());
//! ```
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: a key missing from the document is an error, never a default
//! - **FAIL FAST**: unknown keys and unrecognised option names fail at load time
//! - **VALIDATION**: sections are validated individually, then cross-checked

mod sub_configs;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};

pub use sub_configs::{
    BackboneType, CenterSample, ContinualConfig, DatasetConfig, FpnType, LoaderConfig,
    ModelConfig, NmsMethod, OptimizerConfig, OptimizerType, OutputFormat, RegularizerKind,
    SamplingStrategy, ScheduleType, TestConfig, TrainConfig,
};

/// Serialization format of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    /// Resolve the format from a file extension.
    pub fn from_path(path: &Path) -> CoreResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            _ => Err(CoreError::config(format!(
                "Unsupported config file extension: {} (expected .yaml, .yml, .toml or .json)",
                path.display()
            ))),
        }
    }
}

/// Root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Seed for every random choice made by the core (task order, replay, crops).
    pub init_rand_seed: u64,
    pub dataset_name: String,
    pub dataset: DatasetConfig,
    pub loader: LoaderConfig,
    pub model: ModelConfig,
    pub train_cfg: TrainConfig,
    pub test_cfg: TestConfig,
    pub cl_cfg: ContinualConfig,
    pub opt: OptimizerConfig,
}

impl ExperimentConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_str_with_format(&content, format)?;
        info!(
            path = %path.display(),
            dataset = %config.dataset_name,
            levels = config.model.num_levels(),
            num_classes = config.dataset.num_classes,
            "Loaded experiment config"
        );
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(content: &str) -> CoreResult<Self> {
        Self::from_str_with_format(content, ConfigFormat::Yaml)
    }

    /// Parse and validate a document in the given format.
    pub fn from_str_with_format(content: &str, format: ConfigFormat) -> CoreResult<Self> {
        let config: ExperimentConfig = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Toml => toml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| CoreError::config(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every section, then the constraints spanning sections.
    pub fn validate(&self) -> CoreResult<()> {
        self.dataset.validate()?;
        self.loader.validate()?;
        self.model.validate()?;
        self.train_cfg.validate()?;
        self.test_cfg.validate()?;
        self.cl_cfg.validate()?;
        self.opt.validate()?;

        let div = self.model.max_div_factor();
        if self.dataset.max_seq_len % div != 0 {
            return Err(CoreError::config(format!(
                "dataset.max_seq_len ({}) must be divisible by scale_factor^(levels-1) = {}",
                self.dataset.max_seq_len, div
            )));
        }
        if let Some(bad) = self
            .train_cfg
            .head_empty_cls
            .iter()
            .find(|&&c| c >= self.dataset.num_classes)
        {
            return Err(CoreError::config(format!(
                "train_cfg.head_empty_cls contains class {} but num_classes is {}",
                bad, self.dataset.num_classes
            )));
        }
        if self.cl_cfg.name.is_none() && self.cl_cfg.reg_lambda > 0.0 {
            tracing::warn!(
                reg_lambda = self.cl_cfg.reg_lambda,
                "cl_cfg.reg_lambda is set but cl_cfg.name is null; no penalty will be applied"
            );
        }
        Ok(())
    }
}
