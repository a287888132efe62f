//! Workflow definition files.
//!
//! Parses the YAML format into [`WorkflowDefinition`] and assembles a runnable
//! [`Workflow`] with one [`Backend`] driver per task.

use std::path::Path;

use dagon_core::task::{Task, TaskSettings, TaskSpec};
use dagon_core::workflow::{Workflow, WorkflowError};
use dagon_types::backend::Placement;
use dagon_types::config::EngineConfig;
use dagon_types::workflow::{TaskDefinition, WorkflowDefinition};

use crate::backend::{build_driver, Backend};

pub fn parse_definition(text: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml_ng::from_str(text).map_err(|e| WorkflowError::Parse(e.to_string()))
}

pub async fn load_definition(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let text = tokio::fs::read_to_string(path).await?;
    parse_definition(&text).map_err(|e| match e {
        WorkflowError::Parse(msg) => WorkflowError::Parse(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// A task bound to the driver its backend and placement call for.
pub fn build_task(definition: &TaskDefinition, config: &EngineConfig) -> Task<Backend> {
    let placement = Placement::from_remote(definition.remote.clone());
    let driver = build_driver(&definition.backend, &placement, config);
    let mut spec = TaskSpec::new(definition.name.clone(), definition.command.clone())
        .kind(definition.kind)
        .backend(definition.backend.clone())
        .placement(placement);
    if let Some(dir) = &definition.working_dir {
        spec = spec.working_dir(dir.clone());
    }
    Task::new(spec, driver).with_settings(TaskSettings::from(config))
}

/// Assemble and validate a workflow.
///
/// Explicit `depends_on` edges are added first; reference-inferred edges
/// follow when the definition enables them.
pub fn build_workflow(
    definition: &WorkflowDefinition,
    config: &EngineConfig,
) -> Result<Workflow<Backend>, WorkflowError> {
    if definition.name.trim().is_empty() {
        return Err(WorkflowError::Validation("workflow name is empty".to_string()));
    }
    if definition.tasks.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "workflow '{}' has no tasks",
            definition.name
        )));
    }

    let mut workflow = Workflow::new(definition.name.clone());
    for task in &definition.tasks {
        if task.name.trim().is_empty() {
            return Err(WorkflowError::Validation("task name is empty".to_string()));
        }
        if task.name.contains('/') || task.name.chars().any(char::is_whitespace) {
            return Err(WorkflowError::Validation(format!(
                "task name '{}' may not contain '/' or whitespace",
                task.name
            )));
        }
        workflow.add_task(build_task(task, config))?;
    }
    for task in &definition.tasks {
        for dependency in &task.depends_on {
            workflow.add_dependency(&task.name, dependency)?;
        }
    }
    if definition.infer_dependencies {
        workflow.infer_dependencies();
    }
    if let Some(path) = &definition.checkpoint_file {
        workflow.set_checkpoint_file(path.clone());
    }
    workflow.set_max_concurrency(config.max_concurrency);

    workflow.validate()?;
    tracing::debug!(workflow = %definition.name, tasks = definition.tasks.len(), "workflow assembled");
    Ok(workflow)
}
