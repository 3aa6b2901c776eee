//! CLI argument parsing structures.

use clap::{Args, Parser};
use std::path::PathBuf;

use super::commands::Commands;

/// Main CLI structure for confidant.
#[derive(Parser, Debug)]
#[command(name = "confidant", version)]
#[command(about = "Versioned, encrypted configuration with integration delivery", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Arguments available to all commands.
#[derive(Debug, Default, Args)]
pub struct GlobalArgs {
    /// Path to confidant.kdl (default: search the usual locations)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// SQLite database to use instead of the configured one
    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,
}
