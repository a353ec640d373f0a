//! Error types for the tensor side of egoloc.

use egoloc_core::CoreError;
use thiserror::Error;

/// Errors raised while building, running or training the detector.
///
/// Configuration, shape, sequencing and numeric failures are carried as
/// [`CoreError`] so callers match one taxonomy across both crates.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Tensor operation failed inside candle.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// A shared lock over the parameter map was poisoned by a panicking thread.
    #[error("Parameter map lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ModelError {
    pub fn config(message: impl Into<String>) -> Self {
        ModelError::Core(CoreError::config(message))
    }

    pub fn shape(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        ModelError::Core(CoreError::shape(context, expected, actual))
    }

    pub fn sequencing(message: impl Into<String>) -> Self {
        ModelError::Core(CoreError::TaskSequencing(message.into()))
    }

    pub fn numeric(message: impl Into<String>) -> Self {
        ModelError::Core(CoreError::NumericInstability(message.into()))
    }

    /// The wrapped core error, if this is one.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            ModelError::Core(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;
