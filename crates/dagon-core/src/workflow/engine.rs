//! The run loop.
//!
//! Tasks whose predecessors are all done are spawned onto a `JoinSet`; as
//! each finishes, its dependents are released, or blocked when it failed.
//! Successful checkpoint tasks are persisted and recorded the moment they
//! finish, before any dependent starts. Every sandbox is torn down at the end.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use dagon_types::task::{TaskKind, TaskResult};
use dagon_types::workflow::{TaskOutcome, WorkflowReport};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{CheckpointStore, TaskGraph, Workflow, WorkflowError};
use crate::reference::ReferenceContext;
use crate::sandbox::SandboxDriver;
use crate::task::{Task, TaskError, Teardown};

type Joined = (String, Result<TaskResult, TaskError>);

impl<D: SandboxDriver> Workflow<D> {
    /// Execute the workflow.
    ///
    /// Task failures never surface as `Err`: they are reported in the
    /// returned outcomes and block their descendants. `Err` means the
    /// workflow could not run at all (invalid graph, unreadable checkpoint
    /// file, a panicked task future).
    pub async fn run(&self) -> Result<WorkflowReport, WorkflowError> {
        let graph = self.validate()?;
        let mut outcomes: BTreeMap<String, TaskOutcome> = BTreeMap::new();

        if self.dry_run {
            let waves = graph.waves();
            for name in graph.topological_order() {
                outcomes.insert(name, TaskOutcome::Planned);
            }
            tracing::info!(workflow = %self.name, tasks = outcomes.len(), waves = waves.len(), "dry run complete");
            return Ok(self.report(outcomes));
        }

        tracing::info!(workflow = %self.name, tasks = self.order.len(), "workflow started");

        let mut store = match &self.checkpoint_file {
            Some(path) => Some(CheckpointStore::open(path).await?),
            None => None,
        };
        if let Some(store) = &store {
            self.restore_checkpoints(&graph, store, &mut outcomes).await;
        }

        let result = self.dispatch(&graph, store.as_mut(), &mut outcomes).await;
        self.teardown_all().await;
        result?;

        let report = self.report(outcomes);
        if report.succeeded() {
            tracing::info!(workflow = %self.name, "workflow finished");
        } else {
            tracing::error!(workflow = %self.name, failed = ?report.failed_tasks(), "workflow finished with failures");
        }
        Ok(report)
    }

    fn report(&self, outcomes: BTreeMap<String, TaskOutcome>) -> WorkflowReport {
        WorkflowReport {
            workflow: self.name.clone(),
            dry_run: self.dry_run,
            outcomes,
        }
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Re-attach recorded checkpoint tasks and mark the upstream work they
    /// cover as restored.
    ///
    /// A non-checkpoint task is skipped only when every one of its dependents
    /// is skipped too, so a branch that still needs its output re-runs it.
    async fn restore_checkpoints(
        &self,
        graph: &TaskGraph,
        store: &CheckpointStore,
        outcomes: &mut BTreeMap<String, TaskOutcome>,
    ) {
        let mut skipped: BTreeSet<String> = BTreeSet::new();
        for name in graph.topological_order() {
            let task = &self.tasks[&name];
            if task.kind() != TaskKind::Checkpoint {
                continue;
            }
            let Some(record) = store.get(&self.name, &name) else {
                continue;
            };
            match task.restore(record).await {
                Ok(_) => {
                    skipped.insert(name);
                }
                Err(e) => {
                    tracing::warn!(workflow = %self.name, task = %name, error = %e, "checkpoint unusable, task will run again");
                }
            }
        }
        if skipped.is_empty() {
            return;
        }

        for name in graph.topological_order().into_iter().rev() {
            if skipped.contains(&name) {
                continue;
            }
            let dependents = graph.dependents(&name);
            if !dependents.is_empty() && dependents.iter().all(|d| skipped.contains(d)) {
                skipped.insert(name);
            }
        }

        for name in skipped {
            tracing::info!(workflow = %self.name, task = %name, "skipping, covered by checkpoint");
            outcomes.insert(name, TaskOutcome::Restored);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        graph: &TaskGraph,
        mut store: Option<&mut CheckpointStore>,
        outcomes: &mut BTreeMap<String, TaskOutcome>,
    ) -> Result<(), WorkflowError> {
        let mut pending: BTreeMap<String, BTreeSet<String>> = graph
            .topological_order()
            .into_iter()
            .filter(|name| !outcomes.contains_key(name))
            .map(|name| {
                let preds = graph
                    .predecessors(&name)
                    .into_iter()
                    .filter(|p| !outcomes.contains_key(p))
                    .collect();
                (name, preds)
            })
            .collect();

        let limit = self.max_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let table: Arc<HashMap<String, Arc<Task<D>>>> = Arc::new(self.tasks.clone());
        let workflow: Arc<str> = Arc::from(self.name.as_str());
        let mut join_set: JoinSet<Joined> = JoinSet::new();

        loop {
            let ready: Vec<String> = pending
                .iter()
                .filter(|(_, preds)| preds.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for name in ready {
                pending.remove(&name);
                tracing::debug!(workflow = %self.name, task = %name, "task ready");
                join_set.spawn(run_task(
                    Arc::clone(&self.tasks[&name]),
                    Arc::clone(&table),
                    Arc::clone(&workflow),
                    limit.clone(),
                ));
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (name, result) =
                joined.map_err(|e| WorkflowError::Execution(format!("task join error: {e}")))?;

            let outcome = match result {
                Ok(result) if result.is_success() => {
                    self.complete(&name, result, store.as_deref_mut()).await
                }
                Ok(result) => {
                    tracing::error!(workflow = %self.name, task = %name, code = result.code, "task failed");
                    TaskOutcome::Failed {
                        message: format!("command exited with code {}", result.code),
                        result: Some(result),
                    }
                }
                Err(e) => {
                    tracing::error!(workflow = %self.name, task = %name, error = %e, "task failed");
                    TaskOutcome::Failed {
                        result: None,
                        message: e.to_string(),
                    }
                }
            };

            if outcome.is_complete() {
                for preds in pending.values_mut() {
                    preds.remove(&name);
                }
            } else {
                for blocked in graph.descendants(&name) {
                    if pending.remove(&blocked).is_some() {
                        tracing::warn!(workflow = %self.name, task = %blocked, failed = %name, "blocked by failed predecessor");
                        outcomes.insert(
                            blocked,
                            TaskOutcome::Blocked {
                                failed_predecessor: name.clone(),
                            },
                        );
                    }
                }
            }
            outcomes.insert(name, outcome);
        }

        Ok(())
    }

    /// Outcome of a task whose command succeeded. Checkpoint tasks are
    /// persisted and recorded here; either step failing fails the task.
    async fn complete(
        &self,
        name: &str,
        result: TaskResult,
        store: Option<&mut CheckpointStore>,
    ) -> TaskOutcome {
        let task = &self.tasks[name];
        if task.kind() != TaskKind::Checkpoint {
            return TaskOutcome::Done { result };
        }

        let sandbox = match task.teardown().await {
            Teardown::Persisted(sandbox) => sandbox,
            Teardown::Failed(e) => {
                return TaskOutcome::Failed {
                    result: Some(result),
                    message: e.to_string(),
                };
            }
            other => {
                return TaskOutcome::Failed {
                    result: Some(result),
                    message: format!("checkpoint was not persisted: {other:?}"),
                };
            }
        };

        if let Some(store) = store {
            if let Err(e) = store.record(&self.name, name, &sandbox).await {
                tracing::error!(workflow = %self.name, task = %name, error = %e, "failed to record checkpoint");
                return TaskOutcome::Failed {
                    result: Some(result),
                    message: e.to_string(),
                };
            }
        }
        TaskOutcome::Done { result }
    }

    async fn teardown_all(&self) {
        for task in self.tasks() {
            if let Teardown::Failed(e) = task.teardown().await {
                tracing::warn!(workflow = %self.name, task = %task.name(), error = %e, "teardown failed");
            }
        }
    }
}

async fn run_task<D: SandboxDriver>(
    task: Arc<Task<D>>,
    table: Arc<HashMap<String, Arc<Task<D>>>>,
    workflow: Arc<str>,
    limit: Option<Arc<Semaphore>>,
) -> Joined {
    let _permit = match limit {
        Some(semaphore) => semaphore.acquire_owned().await.ok(),
        None => None,
    };
    let name = task.name().to_string();
    tracing::info!(workflow = %workflow, task = %name, "task running");
    let ctx = ReferenceContext::new(&workflow, &table);
    let result = task.run_once(&ctx).await;
    (name, result)
}
