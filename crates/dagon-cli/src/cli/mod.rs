//! CLI command definitions for the `dagon` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod checkpoint;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dagon_observe::tracing_setup::LogFormat;

/// Run DAG workflows across heterogeneous execution backends.
#[derive(Parser)]
#[command(name = "dagon", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format: text or json.
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file.
    Run {
        /// Path to the workflow YAML file.
        workflow: PathBuf,

        /// Plan only: no sandbox is created and no command runs.
        #[arg(long)]
        dry_run: bool,

        /// Checkpoint file to resume from and record into (overrides the workflow file).
        #[arg(long)]
        checkpoint_file: Option<PathBuf>,

        /// Engine configuration file.
        #[arg(long, default_value = dagon_infra::config::CONFIG_FILE)]
        config: PathBuf,

        /// Leave sandboxes in place after the run.
        #[arg(long)]
        keep: bool,

        /// Maximum number of tasks running at once.
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Validate a workflow file and print its audit description.
    Validate {
        /// Path to the workflow YAML file.
        workflow: PathBuf,

        /// Engine configuration file.
        #[arg(long, default_value = dagon_infra::config::CONFIG_FILE)]
        config: PathBuf,
    },

    /// Inspect checkpoint files.
    Checkpoint {
        #[command(subcommand)]
        command: checkpoint::CheckpointCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

impl Cli {
    /// Default log filter for the verbosity flags, used when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,dagon_core=debug,dagon_infra=debug",
            _ => "trace",
        }
    }
}
