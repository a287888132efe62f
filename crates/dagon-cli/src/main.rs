//! Dagon CLI entry point.
//!
//! Binary name: `dagon`
//!
//! Parses CLI arguments, initializes logging, then dispatches to the command
//! handler.

mod cli;

use anyhow::anyhow;
use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use dagon_observe::tracing_setup::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format, cli.log_filter())
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;

    match cli.command {
        Commands::Run {
            workflow,
            dry_run,
            checkpoint_file,
            config,
            keep,
            max_concurrency,
        } => {
            let opts = cli::workflow::RunOptions {
                workflow: &workflow,
                config: &config,
                checkpoint_file: checkpoint_file.as_deref(),
                dry_run,
                keep,
                max_concurrency,
            };
            cli::workflow::handle_run(opts, cli.json, cli.quiet).await?;
        }

        Commands::Validate { workflow, config } => {
            cli::workflow::handle_validate(&workflow, &config, cli.json).await?;
        }

        Commands::Checkpoint { command } => {
            cli::checkpoint::handle_checkpoint_command(command, cli.json).await?;
        }

        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "dagon", &mut std::io::stdout());
        }
    }

    Ok(())
}
