//! Lazyflow CLI - Command-line interface for the lazyflow dataflow engine.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lazyflow")]
#[command(author, version, about = "Lazyflow dataflow engine CLI", long_about = None)]
struct Cli {
    /// Settings file (defaults to the user settings file, if any)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level regardless of RUST_LOG and the settings file
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep tiles through a cached box filter and report cache statistics
    Bench(commands::bench::BenchArgs),

    /// List the blocks a region touches
    Blocks(commands::blocks::BlocksArgs),

    /// Paint, export and import label arrays
    Labels(commands::labels::LabelsArgs),

    /// Show the effective settings
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let loaded = commands::common::load_settings(cli.config.as_deref())?;

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&loaded.settings.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Bench(args) => commands::bench::run(args, &loaded),
        Commands::Blocks(args) => commands::blocks::run(args, &loaded),
        Commands::Labels(args) => commands::labels::run(args, &loaded),
        Commands::Config(args) => commands::config::run(args, &loaded),
    }
}
