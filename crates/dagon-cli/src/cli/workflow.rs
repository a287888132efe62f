//! `dagon run` and `dagon validate`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use dagon_core::workflow::{Workflow, WorkflowError};
use dagon_infra::backend::Backend;
use dagon_infra::config::load_engine_config;
use dagon_infra::definition::{build_workflow, load_definition};
use dagon_types::config::EngineConfig;
use dagon_types::workflow::{TaskOutcome, WorkflowReport};

/// Options of `dagon run`.
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub workflow: &'a Path,
    pub config: &'a Path,
    pub checkpoint_file: Option<&'a Path>,
    pub dry_run: bool,
    pub keep: bool,
    pub max_concurrency: Option<usize>,
}

async fn load(workflow: &Path, config: EngineConfig) -> Result<Workflow<Backend>> {
    let definition = load_definition(workflow).await.map_err(|e| match e {
        WorkflowError::Parse(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        other => anyhow::anyhow!("Failed to load {}: {other}", workflow.display()),
    })?;
    tracing::debug!(path = %workflow.display(), workflow = %definition.name, "loaded workflow definition");
    build_workflow(&definition, &config)
        .with_context(|| format!("Workflow '{}' is invalid", definition.name))
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(opts: RunOptions<'_>, json: bool, quiet: bool) -> Result<()> {
    let mut config = load_engine_config(opts.config).await;
    if opts.keep {
        config.keep_sandboxes = true;
    }
    if opts.max_concurrency.is_some() {
        config.max_concurrency = opts.max_concurrency;
    }

    let mut workflow = load(opts.workflow, config).await?;
    if let Some(path) = opts.checkpoint_file {
        workflow.set_checkpoint_file(path);
    }
    workflow.set_dry_run(opts.dry_run);

    if !json && !quiet {
        println!();
        println!(
            "  {} Running workflow '{}'{}",
            style("▶").bold(),
            style(workflow.name()).cyan(),
            if opts.dry_run { " (dry run)" } else { "" }
        );
    }

    let report = workflow
        .run()
        .await
        .with_context(|| format!("Workflow '{}' could not run", workflow.name()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !quiet {
        print_report(&workflow, &report);
    }

    if !report.succeeded() {
        bail!(
            "workflow '{}' did not complete: failed tasks [{}]",
            report.workflow,
            report.failed_tasks().join(", ")
        );
    }
    Ok(())
}

fn outcome_cell(outcome: &TaskOutcome) -> Cell {
    match outcome {
        TaskOutcome::Done { .. } => Cell::new("done").fg(Color::Green),
        TaskOutcome::Restored => Cell::new("restored").fg(Color::Cyan),
        TaskOutcome::Failed { .. } => Cell::new("failed").fg(Color::Red),
        TaskOutcome::Blocked { .. } => Cell::new("blocked").fg(Color::Yellow),
        TaskOutcome::Planned => Cell::new("planned").fg(Color::DarkGrey),
    }
}

/// Exit code and a one-line summary for the detail columns.
fn outcome_detail(outcome: &TaskOutcome) -> (String, String) {
    match outcome {
        TaskOutcome::Done { result } => (
            result.code.to_string(),
            result.result().unwrap_or_else(|| result.output.clone()),
        ),
        TaskOutcome::Failed { result, message } => (
            result
                .as_ref()
                .map(|r| r.code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            message.clone(),
        ),
        TaskOutcome::Blocked { failed_predecessor } => {
            ("-".to_string(), format!("waiting on failed '{failed_predecessor}'"))
        }
        TaskOutcome::Restored => ("-".to_string(), "from checkpoint".to_string()),
        TaskOutcome::Planned => ("-".to_string(), String::new()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}…")
    }
}

fn print_report(workflow: &Workflow<Backend>, report: &WorkflowReport) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Backend"),
            Cell::new("Status"),
            Cell::new("Code"),
            Cell::new("Output"),
        ]);

    for task in workflow.tasks() {
        let Some(outcome) = report.outcomes.get(task.name()) else {
            continue;
        };
        let (code, detail) = outcome_detail(outcome);
        table.add_row(vec![
            Cell::new(task.name()),
            Cell::new(task.spec().backend.kind().to_string()),
            outcome_cell(outcome),
            Cell::new(code),
            Cell::new(truncate(&detail, 80)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    if report.succeeded() {
        println!("  {} Workflow '{}' completed", style("✓").green(), report.workflow);
    } else {
        println!("  {} Workflow '{}' failed", style("✗").red(), report.workflow);
    }
    println!();
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub async fn handle_validate(workflow: &Path, config: &Path, json: bool) -> Result<()> {
    let config = load_engine_config(config).await;
    let workflow = load(workflow, config).await?;
    let audit = workflow.as_json();

    if json {
        println!("{}", serde_json::to_string_pretty(&audit)?);
        return Ok(());
    }

    let graph = workflow.validate()?;
    println!();
    println!(
        "  {} Workflow '{}' is valid ({} tasks)",
        style("✓").green(),
        style(workflow.name()).cyan(),
        graph.topological_order().len()
    );
    println!();
    for (depth, wave) in graph.waves().iter().enumerate() {
        println!("  {} {}", style(format!("wave {depth}:")).dim(), wave.join(", "));
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&audit)?);
    Ok(())
}
