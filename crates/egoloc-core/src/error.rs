//! Error types for egoloc-core.

use thiserror::Error;

/// Top-level error type for egoloc-core.
///
/// None of these are retried internally; they are surfaced to the caller
/// (the outer training-loop driver), which decides whether to abort the run or
/// skip the batch.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Missing, unknown or out-of-range configuration field.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Tensor or feature width does not match the configured shape.
    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A sample or lifecycle call is inconsistent with the continual task sequence.
    #[error("Task sequencing error: {0}")]
    TaskSequencing(String),

    /// A loss or gradient became NaN or infinite.
    #[error("Numeric instability: {0}")]
    NumericInstability(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Shorthand for [`CoreError::ConfigError`].
    pub fn config(message: impl Into<String>) -> Self {
        CoreError::ConfigError(message.into())
    }

    /// Shorthand for [`CoreError::ShapeMismatch`].
    pub fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        CoreError::ShapeMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::ConfigError(err.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(err: toml::de::Error) -> Self {
        CoreError::ConfigError(err.to_string())
    }
}

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
