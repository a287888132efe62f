//! The per-task state machine.
//!
//! A [`Task`] owns exactly one lazily created sandbox (guarded by an async
//! mutex so concurrent triggers provision it once), a one-shot execution guard
//! with result memoization, and deferred cleanup. Backend differences live
//! entirely behind the [`SandboxDriver`] it is constructed with; whether that
//! driver reaches its tooling locally or over secure shell is fixed when the
//! driver is built and is invisible here.

pub mod error;

pub use error::TaskError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dagon_types::backend::{BackendConfig, Placement};
use dagon_types::checkpoint::CheckpointRecord;
use dagon_types::config::EngineConfig;
use dagon_types::sandbox::SandboxInfo;
use dagon_types::task::{TaskKind, TaskResult};
use tokio::sync::{Mutex, OnceCell};

use crate::escape::{combine_output, package_result, TIMEOUT_EXIT_CODE};
use crate::reference::{resolve_references, ReferenceContext};
use crate::sandbox::{SandboxDriver, SandboxError, SandboxRequest, CHECKPOINT_SUFFIX, INPUTS_DIR};

/// Path (relative to the sandbox root) of the checkpoint verification script.
pub const CHECKPOINT_SCRIPT: &str = ".dagon/checkpoint.sh";

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Static description of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub command: String,
    pub kind: TaskKind,
    pub backend: BackendConfig,
    pub placement: Placement,
    pub working_dir: Option<String>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            kind: TaskKind::Standard,
            backend: BackendConfig::Batch,
            placement: Placement::Local,
            working_dir: None,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Execution knobs shared by every task of a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSettings {
    /// Upper bound for one backend command.
    pub command_timeout: Duration,
    /// Leave the sandbox in place on teardown.
    pub keep_sandbox: bool,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for TaskSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            command_timeout: config.command_timeout(),
            keep_sandbox: config.keep_sandboxes,
        }
    }
}

/// What `teardown` did.
#[derive(Debug)]
pub enum Teardown {
    /// No sandbox existed.
    Absent,
    Destroyed,
    /// Left in place because of the keep flag.
    Kept,
    /// Checkpoint sandbox renamed; holds the relocated sandbox.
    Persisted(SandboxInfo),
    /// Logged and swallowed; reported for the engine's bookkeeping only.
    Failed(TaskError),
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub struct Task<D: SandboxDriver> {
    spec: TaskSpec,
    driver: D,
    settings: TaskSettings,
    sandbox: Mutex<Option<SandboxInfo>>,
    result: OnceCell<TaskResult>,
    persisted: AtomicBool,
}

impl<D: SandboxDriver> std::fmt::Debug for Task<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.spec.name)
            .field("kind", &self.spec.kind)
            .field("backend", &self.driver.kind())
            .field("executed", &self.result.initialized())
            .finish()
    }
}

impl<D: SandboxDriver> Task<D> {
    pub fn new(spec: TaskSpec, driver: D) -> Self {
        Self {
            spec,
            driver,
            settings: TaskSettings::default(),
            sandbox: Mutex::new(None),
            result: OnceCell::new(),
            persisted: AtomicBool::new(false),
        }
    }

    pub fn with_settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn command(&self) -> &str {
        &self.spec.command
    }

    pub fn kind(&self) -> TaskKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn is_remote(&self) -> bool {
        self.spec.placement.is_remote()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Memoized result, if the task has executed (or was restored).
    pub fn result(&self) -> Option<&TaskResult> {
        self.result.get()
    }

    /// Current sandbox, without provisioning one.
    pub async fn sandbox(&self) -> Option<SandboxInfo> {
        self.sandbox.lock().await.clone()
    }

    /// Provision the sandbox on first call; later and concurrent callers get
    /// the same instance. A failed attempt leaves the task without a sandbox.
    pub async fn ensure_sandbox(&self) -> Result<SandboxInfo, TaskError> {
        let mut slot = self.sandbox.lock().await;
        if let Some(sandbox) = slot.as_ref() {
            return Ok(sandbox.clone());
        }

        let request = SandboxRequest::new(&self.spec.name, self.spec.working_dir.clone());
        tracing::debug!(task = %self.spec.name, sandbox = %request.id, backend = %self.driver.kind(), "provisioning sandbox");

        let sandbox = self
            .driver
            .create(&request)
            .await
            .map_err(|source| TaskError::Provisioning {
                task: self.spec.name.clone(),
                source,
            })?;

        tracing::info!(
            task = %self.spec.name,
            sandbox = %sandbox.id,
            location = %sandbox.location,
            working_dir = %sandbox.working_dir,
            "sandbox ready"
        );
        *slot = Some(sandbox.clone());
        Ok(sandbox)
    }

    /// Run `command` in the sandbox and package its output.
    ///
    /// Backend noise is stripped from stderr; a timeout surfaces as
    /// [`TaskError::ExecutionTimeout`].
    pub async fn execute(&self, command: &str) -> Result<TaskResult, TaskError> {
        let sandbox = self.ensure_sandbox().await?;
        tracing::debug!(task = %self.spec.name, sandbox = %sandbox.id, command, "executing");

        match self
            .driver
            .run(&sandbox, command, self.settings.command_timeout)
            .await
        {
            Ok(output) => {
                let text = combine_output(&output.stdout, &output.stderr, self.driver.noise_markers());
                Ok(package_result(&text, output.code))
            }
            Err(SandboxError::Timeout(after)) => Err(TaskError::ExecutionTimeout {
                task: self.spec.name.clone(),
                after,
            }),
            Err(source) => Err(TaskError::Execution {
                task: self.spec.name.clone(),
                source,
            }),
        }
    }

    /// Execute the task's command once.
    ///
    /// The first call resolves cross-task references, executes and memoizes
    /// the result; every later (or concurrent) call returns the memoized
    /// result without touching the backend. A timeout is memoized as a failed
    /// result and never retried.
    pub async fn run_once(&self, ctx: &ReferenceContext<'_, D>) -> Result<TaskResult, TaskError> {
        let result = self
            .result
            .get_or_try_init(|| async {
                let command = self.prepare_command(ctx).await?;
                match self.execute(&command).await {
                    Err(TaskError::ExecutionTimeout { task, after }) => {
                        tracing::warn!(task = %task, ?after, "command timed out");
                        Ok(package_result(
                            &format!("command timed out after {}s", after.as_secs()),
                            TIMEOUT_EXIT_CODE,
                        ))
                    }
                    other => other,
                }
            })
            .await?;

        tracing::info!(task = %self.spec.name, code = result.code, "task finished");
        Ok(result.clone())
    }

    async fn prepare_command(&self, ctx: &ReferenceContext<'_, D>) -> Result<String, TaskError> {
        let resolved = resolve_references(self, &self.spec.command, ctx).await?;
        match self.spec.kind {
            TaskKind::Standard => Ok(resolved),
            TaskKind::Checkpoint => {
                self.install_checkpoint_script().await?;
                Ok(format!("bash {CHECKPOINT_SCRIPT} {resolved}"))
            }
        }
    }

    async fn install_checkpoint_script(&self) -> Result<(), TaskError> {
        let sandbox = self.ensure_sandbox().await?;
        self.driver
            .write_file(&sandbox, CHECKPOINT_SCRIPT, checkpoint_script().as_bytes())
            .await
            .map_err(|e| TaskError::Staging {
                task: self.spec.name.clone(),
                reference: CHECKPOINT_SCRIPT.to_string(),
                message: e.to_string(),
            })
    }

    /// Release the sandbox.
    ///
    /// A successful checkpoint task is persisted instead (renamed with a fixed
    /// suffix and kept attached so dependents can still read from it). Safe to
    /// call repeatedly; failures are logged, never propagated.
    pub async fn teardown(&self) -> Teardown {
        let checkpointed = self.spec.kind == TaskKind::Checkpoint
            && self.result.get().is_some_and(TaskResult::is_success);
        if checkpointed {
            return self.persist().await;
        }

        let Some(sandbox) = self.sandbox.lock().await.take() else {
            return Teardown::Absent;
        };
        if self.settings.keep_sandbox {
            tracing::info!(task = %self.spec.name, sandbox = %sandbox.id, "keeping sandbox");
            return Teardown::Kept;
        }

        match self.driver.destroy(&sandbox).await {
            Ok(()) => {
                tracing::debug!(task = %self.spec.name, sandbox = %sandbox.id, "sandbox destroyed");
                Teardown::Destroyed
            }
            Err(e) => {
                tracing::warn!(task = %self.spec.name, sandbox = %sandbox.id, error = %e, "sandbox cleanup failed");
                Teardown::Failed(TaskError::Cleanup {
                    task: self.spec.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn persist(&self) -> Teardown {
        let mut slot = self.sandbox.lock().await;
        let Some(sandbox) = slot.as_ref() else {
            return Teardown::Absent;
        };
        if self.persisted.load(Ordering::Acquire) {
            return Teardown::Persisted(sandbox.clone());
        }

        match self.driver.persist(sandbox, CHECKPOINT_SUFFIX).await {
            Ok(moved) => {
                tracing::info!(task = %self.spec.name, working_dir = %moved.working_dir, "checkpoint persisted");
                *slot = Some(moved.clone());
                self.persisted.store(true, Ordering::Release);
                Teardown::Persisted(moved)
            }
            Err(e) => {
                tracing::error!(task = %self.spec.name, error = %e, "failed to persist checkpoint");
                Teardown::Failed(TaskError::Cleanup {
                    task: self.spec.name.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// Re-attach a checkpoint task to the directory recorded by an earlier run
    /// and mark it executed.
    pub async fn restore(&self, record: &CheckpointRecord) -> Result<SandboxInfo, TaskError> {
        let sandbox = self
            .driver
            .attach(&self.spec.name, &record.working_dir)
            .await
            .map_err(|source| TaskError::Provisioning {
                task: self.spec.name.clone(),
                source,
            })?;

        *self.sandbox.lock().await = Some(sandbox.clone());
        // Already set only if the task ran earlier in this process.
        let _ = self
            .result
            .set(package_result("restored from checkpoint", 0));
        self.persisted.store(true, Ordering::Release);

        tracing::info!(task = %self.spec.name, working_dir = %record.working_dir, "restored from checkpoint");
        Ok(sandbox)
    }
}

/// Verification script run by checkpoint tasks: every argument must be an
/// existing file, then staged inputs move into the sandbox root.
fn checkpoint_script() -> String {
    format!(
        r#"#!/bin/bash
for input in "$@"; do
  if ! [ -f "$input" ]; then
    echo "checkpoint input missing: $input" >&2
    exit 1
  fi
done
if [ -d {INPUTS_DIR} ] && [ -n "$(ls -A {INPUTS_DIR})" ]; then
  mv {INPUTS_DIR}/* ./
fi
"#
    )
}
