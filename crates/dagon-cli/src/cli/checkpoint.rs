//! `dagon checkpoint` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use dagon_core::workflow::CheckpointStore;

#[derive(Subcommand)]
pub enum CheckpointCommand {
    /// List the tasks recorded in a checkpoint file.
    Show {
        /// Path to the checkpoint file.
        file: PathBuf,
    },
}

pub async fn handle_checkpoint_command(cmd: CheckpointCommand, json: bool) -> Result<()> {
    match cmd {
        CheckpointCommand::Show { file } => handle_show(&file, json).await,
    }
}

async fn handle_show(file: &Path, json: bool) -> Result<()> {
    let store = CheckpointStore::open(file)
        .await
        .with_context(|| format!("Failed to read checkpoint file {}", file.display()))?;
    let records = store.records();

    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!();
        println!("  No checkpoints recorded in {}.", file.display());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Location"),
            Cell::new("Working directory"),
            Cell::new("Recorded"),
        ]);

    for (key, record) in records.iter() {
        table.add_row(vec![
            Cell::new(key),
            Cell::new(record.location.as_deref().unwrap_or("local")),
            Cell::new(&record.working_dir),
            Cell::new(
                record
                    .recorded_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!();
    println!(
        "  {} checkpoint(s) in {}",
        style(records.len()).bold(),
        style(file.display()).cyan()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}
