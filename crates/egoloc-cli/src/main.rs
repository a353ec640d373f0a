//! egoloc CLI
//!
//! # Commands
//!
//! - `validate`: load and validate an experiment config, print the pyramid
//! - `tasks`: resolve and print the continual task order
//! - `smoke`: one training step and one decode on synthetic features
//!
//! Logs go to stderr, filtered by `RUST_LOG` (default `info`). Exit code 0 on
//! success, 1 on error.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{smoke::SmokeArgs, tasks::TasksArgs, validate::ValidateArgs};

#[derive(Parser)]
#[command(name = "egoloc", version, about = "Text-conditioned temporal action localization")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the resolved pyramid
    Validate(ValidateArgs),
    /// Print the continual task order resolved from `cl_cfg`
    Tasks(TasksArgs),
    /// Run one training step and one decode on synthetic features
    Smoke(SmokeArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Validate(args) => commands::validate::handle(args),
        Commands::Tasks(args) => commands::tasks::handle(args),
        Commands::Smoke(args) => commands::smoke::handle(args),
    };
    std::process::exit(code);
}
