//! Task error taxonomy.

use std::time::Duration;

use crate::sandbox::SandboxError;

/// Errors that abort a task (and, through the engine, its dependents).
///
/// Cleanup failures are part of the taxonomy but are only ever logged: they
/// happen after the result is memoized and never reach the caller of
/// `run_once`.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The sandbox could not be created. Fatal for the task; retryable by a later call.
    #[error("task '{task}': provisioning failed: {source}")]
    Provisioning {
        task: String,
        #[source]
        source: SandboxError,
    },

    /// An export or import of a referenced file failed.
    #[error("task '{task}': staging '{reference}' failed: {message}")]
    Staging {
        task: String,
        reference: String,
        message: String,
    },

    /// The command exceeded its time bound.
    #[error("task '{task}': command timed out after {after:?}")]
    ExecutionTimeout { task: String, after: Duration },

    /// The command could not be dispatched to the backend.
    #[error("task '{task}': execution failed: {source}")]
    Execution {
        task: String,
        #[source]
        source: SandboxError,
    },

    /// Teardown could not remove or relocate the sandbox.
    #[error("task '{task}': cleanup failed: {message}")]
    Cleanup { task: String, message: String },

    /// A reference names a task that is not part of the workflow.
    #[error("task '{task}' references unknown task '{referenced}'")]
    UnknownTask { task: String, referenced: String },
}

impl TaskError {
    /// Name of the task the error belongs to.
    pub fn task(&self) -> &str {
        match self {
            Self::Provisioning { task, .. }
            | Self::Staging { task, .. }
            | Self::ExecutionTimeout { task, .. }
            | Self::Execution { task, .. }
            | Self::Cleanup { task, .. }
            | Self::UnknownTask { task, .. } => task,
        }
    }
}
