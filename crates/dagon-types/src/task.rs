//! Task-level types: roles and the uniform structured result.

use serde::{Deserialize, Serialize};

/// Role of a task inside a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Standard,
    /// Verifies its referenced inputs, persists its sandbox and records
    /// recovery metadata when it completes.
    Checkpoint,
}

/// Uniform result of one task execution, regardless of backend.
///
/// `output` is itself a JSON document of the form `{"result": "<text>"}` where
/// newlines and tabs inside the text are escaped as `\n` / `\t`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    pub code: i32,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The wrapped `result` field, if `output` is a well-formed record.
    pub fn result(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.output).ok()?;
        value.get("result")?.as_str().map(str::to_string)
    }
}
