//! Command and subcommand definitions.

use clap::Subcommand;
use std::path::PathBuf;

/// Top-level commands available in confidant.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the delivery workers and the reconciler schedule until Ctrl-C
    Serve,
    /// Run one reconciliation pass and print what it did
    Reconcile {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate an X25519 keypair (hex), e.g. for the server key
    Keygen,
    /// Show recorded events, newest first
    Log {
        /// Maximum number of events to show
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Only events of this workspace
        #[arg(short, long)]
        workspace: Option<String>,

        /// Only events about this target id
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Manage configuration (shows current config if no subcommand provided)
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Write a commented config file with default values
    Generate {
        /// Where to write it (default: ./confidant.kdl)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        overwrite: bool,
    },
    /// Print the effective configuration as KDL
    Show,
    /// Get a single setting (e.g. "queue.retry_limit")
    Get {
        /// Setting key, as node.property
        key: String,
    },
}
