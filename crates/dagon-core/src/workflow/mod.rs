//! Workflow: a named DAG of tasks plus the engine that runs it.
//!
//! The caller builds a [`Workflow`] once (tasks, explicit edges, optionally
//! inferred reference edges), then calls [`Workflow::run`]. Running validates
//! the graph, restores recorded checkpoints, dispatches ready tasks
//! concurrently and returns a [`WorkflowReport`](dagon_types::workflow::WorkflowReport).

pub mod checkpoint;
pub mod dag;
mod engine;

pub use checkpoint::CheckpointStore;
pub use dag::TaskGraph;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::reference::referenced_tasks;
use crate::sandbox::SandboxDriver;
use crate::task::{Task, TaskError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that stop a workflow as a whole. Individual task failures are
/// reported as outcomes instead.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Workflow file could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("duplicate task name '{0}'")]
    DuplicateTask(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Checkpoint file could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// The engine itself failed (e.g. a task future panicked).
    #[error("execution error: {0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Task(#[from] TaskError),
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct Workflow<D: SandboxDriver> {
    name: String,
    tasks: HashMap<String, Arc<Task<D>>>,
    /// Insertion order, for stable reporting.
    order: Vec<String>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
    checkpoint_file: Option<PathBuf>,
    dry_run: bool,
    max_concurrency: Option<usize>,
}

impl<D: SandboxDriver> std::fmt::Debug for Workflow<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("tasks", &self.order)
            .field("predecessors", &self.predecessors)
            .field("checkpoint_file", &self.checkpoint_file)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl<D: SandboxDriver> Workflow<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: HashMap::new(),
            order: Vec::new(),
            predecessors: BTreeMap::new(),
            checkpoint_file: None,
            dry_run: false,
            max_concurrency: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_task(&mut self, task: Task<D>) -> Result<Arc<Task<D>>, WorkflowError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(WorkflowError::DuplicateTask(name));
        }
        let task = Arc::new(task);
        self.tasks.insert(name.clone(), Arc::clone(&task));
        self.predecessors.insert(name.clone(), BTreeSet::new());
        self.order.push(name);
        Ok(task)
    }

    /// Declare that `task` runs only after `depends_on` is done.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<(), WorkflowError> {
        if !self.tasks.contains_key(depends_on) {
            return Err(WorkflowError::UnknownDependency(format!(
                "task '{task}' depends on unknown task '{depends_on}'"
            )));
        }
        let preds = self.predecessors.get_mut(task).ok_or_else(|| {
            WorkflowError::UnknownDependency(format!("no task named '{task}'"))
        })?;
        preds.insert(depends_on.to_string());
        Ok(())
    }

    /// Add an edge for every cross-task reference found in a command.
    /// Self references and references to unknown tasks are left alone; the
    /// latter are rejected by validation.
    pub fn infer_dependencies(&mut self) {
        for name in &self.order {
            let referenced = referenced_tasks(self.tasks[name].command());
            let Some(preds) = self.predecessors.get_mut(name) else {
                continue;
            };
            for source in referenced {
                if source != *name && self.tasks.contains_key(&source) {
                    tracing::debug!(workflow = %self.name, task = %name, depends_on = %source, "inferred dependency");
                    preds.insert(source);
                }
            }
        }
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn set_checkpoint_file(&mut self, path: impl Into<PathBuf>) {
        self.checkpoint_file = Some(path.into());
    }

    pub fn checkpoint_file(&self) -> Option<&Path> {
        self.checkpoint_file.as_deref()
    }

    /// Limit the number of tasks running at once. `None` is unbounded.
    pub fn set_max_concurrency(&mut self, limit: Option<usize>) {
        self.max_concurrency = limit;
    }

    pub fn task(&self, name: &str) -> Option<&Arc<Task<D>>> {
        self.tasks.get(name)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<Task<D>>> {
        self.order.iter().map(|name| &self.tasks[name])
    }

    pub fn predecessors(&self, task: &str) -> Option<&BTreeSet<String>> {
        self.predecessors.get(task)
    }

    /// Check graph shape and that every reference names a known task.
    pub fn validate(&self) -> Result<TaskGraph, WorkflowError> {
        for name in &self.order {
            for referenced in referenced_tasks(self.tasks[name].command()) {
                if !self.tasks.contains_key(&referenced) {
                    return Err(TaskError::UnknownTask {
                        task: name.clone(),
                        referenced,
                    }
                    .into());
                }
            }
        }
        TaskGraph::build(&self.order, &self.predecessors)
    }

    /// Audit description of the workflow.
    pub fn as_json(&self) -> serde_json::Value {
        let tasks: Vec<serde_json::Value> = self
            .tasks()
            .map(|task| {
                let spec = task.spec();
                json!({
                    "name": spec.name,
                    "command": spec.command,
                    "kind": spec.kind,
                    "backend": spec.backend,
                    "placement": spec.placement,
                    "working_dir": spec.working_dir,
                    "predecessors": self.predecessors.get(&spec.name),
                })
            })
            .collect();

        json!({
            "name": self.name,
            "dry_run": self.dry_run,
            "checkpoint_file": self.checkpoint_file,
            "tasks": tasks,
        })
    }
}
