//! CLI command handlers
//!
//! Every handler returns the process exit code: 0 on success, 1 on error.

pub mod smoke;
pub mod tasks;
pub mod validate;

use std::path::Path;

use anyhow::Context;
use egoloc_core::ExperimentConfig;
use tracing::error;

/// Load a config, attaching the path to any failure.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<ExperimentConfig> {
    ExperimentConfig::from_file(path).with_context(|| format!("invalid config {}", path.display()))
}

/// Report an error on stderr and map it to exit code 1.
pub(crate) fn exit_code(result: anyhow::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            1
        }
    }
}
