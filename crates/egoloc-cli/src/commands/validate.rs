//! `egoloc validate`: load a config and show the pyramid it builds.

use std::path::PathBuf;

use clap::Args;
use egoloc_core::PyramidLayout;
use serde::Serialize;
use tracing::info;

use super::{exit_code, load_config};

#[derive(Args)]
pub struct ValidateArgs {
    /// Experiment configuration (.yaml, .yml, .toml or .json)
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ValidationSummary<'a> {
    dataset: &'a str,
    num_classes: usize,
    input_dim: usize,
    total_positions: usize,
    layout: &'a PyramidLayout,
}

pub fn handle(args: ValidateArgs) -> i32 {
    exit_code(run(&args))
}

fn run(args: &ValidateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let layout = PyramidLayout::from_config(&config.model, &config.dataset)?;
    let summary = ValidationSummary {
        dataset: &config.dataset_name,
        num_classes: config.dataset.num_classes,
        input_dim: config.dataset.input_dim,
        total_positions: layout.total_positions(),
        layout: &layout,
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}: {} classes, {} input channels, {} levels, {} positions",
            summary.dataset,
            summary.num_classes,
            summary.input_dim,
            layout.num_levels(),
            summary.total_positions
        );
        for level in layout.levels() {
            println!(
                "  level {:>2}  length {:>5}  stride {:>4}  range [{}, {})",
                level.index, level.length, level.stride, level.regression_range.0, level.regression_range.1
            );
        }
    }
    info!(path = %args.config.display(), "Config is valid");
    Ok(())
}
