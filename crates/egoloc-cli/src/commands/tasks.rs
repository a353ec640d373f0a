//! `egoloc tasks`: print the continual task order.

use std::path::{Path, PathBuf};

use clap::Args;
use egoloc_core::continual::TaskSchedule;

use super::{exit_code, load_config};

#[derive(Args)]
pub struct TasksArgs {
    /// Experiment configuration; `cl_cfg.pkl_file` is resolved relative to it
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output as JSON instead of human-readable
    #[arg(long)]
    pub json: bool,
}

pub fn handle(args: TasksArgs) -> i32 {
    exit_code(run(&args))
}

fn run(args: &TasksArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let base_dir = args.config.parent().unwrap_or_else(|| Path::new("."));
    let schedule = TaskSchedule::from_config(&config, base_dir)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(schedule.tasks())?);
        return Ok(());
    }
    println!(
        "{} tasks ({} order, seed {})",
        schedule.len(),
        if config.cl_cfg.random_order { "shuffled" } else { "manifest" },
        config.init_rand_seed
    );
    for task in schedule.tasks() {
        println!("  task {:>2}: {} classes {:?}", task.index, task.classes.len(), task.classes);
    }
    Ok(())
}
