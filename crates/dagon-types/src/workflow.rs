//! Workflow definition file format and run reporting types.
//!
//! `WorkflowDefinition` is what a YAML workflow file deserializes into. The
//! infra layer turns it into a runnable workflow; the engine reports back with
//! a `WorkflowReport`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendConfig, RemoteConfig};
use crate::task::{TaskKind, TaskResult};

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A workflow as written in a definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Where checkpoint records are read from and written to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_file: Option<PathBuf>,
    /// Add edges for every cross-task reference found in commands.
    #[serde(default = "default_infer_dependencies")]
    pub infer_dependencies: bool,
    pub tasks: Vec<TaskDefinition>,
}

fn default_infer_dependencies() -> bool {
    true
}

/// One task entry of a workflow file.
///
/// ```yaml
/// - name: B
///   command: "cat workflow:///A/out/f1.txt"
///   backend: { type: docker, image: "ubuntu:22.04" }
///   remote: { host: 10.0.0.5, user: hpc }
///   depends_on: [A]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// Fixed working directory instead of a generated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub kind: TaskKind,
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Final state of one task after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Executed successfully in this run.
    Done { result: TaskResult },
    /// Recognised as complete from a checkpoint file; not executed.
    Restored,
    /// Executed with a non-zero code, or could not be executed at all.
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<TaskResult>,
        message: String,
    },
    /// Never started because a predecessor failed.
    Blocked { failed_predecessor: String },
    /// Dry run: would have executed.
    Planned,
}

impl TaskOutcome {
    /// Whether dependents may proceed after this outcome.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Restored | Self::Planned)
    }
}

/// Outcome of a whole workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow: String,
    pub dry_run: bool,
    pub outcomes: BTreeMap<String, TaskOutcome>,
}

impl WorkflowReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.values().all(TaskOutcome::is_complete)
    }

    pub fn failed_tasks(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, TaskOutcome::Failed { .. }))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: DataFlow-Demo
checkpoint_file: last_run.json
tasks:
  - name: A
    command: "mkdir output; hostname > output/f1.txt"
  - name: B
    command: "cat workflow:///A/output/f1.txt"
    backend:
      type: docker
      image: "ubuntu:22.04"
    remote:
      host: 10.0.0.5
      user: hpc
  - name: Checkpoint_1
    command: "workflow:///B/f2.txt"
    kind: checkpoint
"#;

    #[test]
    fn parse_workflow_definition_yaml() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE).unwrap();
        assert_eq!(def.name, "DataFlow-Demo");
        assert!(def.infer_dependencies);
        assert_eq!(def.tasks.len(), 3);
        assert_eq!(def.tasks[0].backend, BackendConfig::Batch);
        assert_eq!(def.tasks[1].remote.as_ref().unwrap().port, 22);
        assert_eq!(def.tasks[2].kind, TaskKind::Checkpoint);
    }

    #[test]
    fn report_success_ignores_restored_tasks() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert("A".to_string(), TaskOutcome::Restored);
        outcomes.insert(
            "B".to_string(),
            TaskOutcome::Done {
                result: TaskResult {
                    output: "{}".to_string(),
                    code: 0,
                },
            },
        );
        let report = WorkflowReport {
            workflow: "wf".to_string(),
            dry_run: false,
            outcomes,
        };
        assert!(report.succeeded());
        assert!(report.failed_tasks().is_empty());
    }

    #[test]
    fn report_lists_failed_tasks() {
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            "A".to_string(),
            TaskOutcome::Failed {
                result: None,
                message: "provisioning failed".to_string(),
            },
        );
        outcomes.insert(
            "B".to_string(),
            TaskOutcome::Blocked {
                failed_predecessor: "A".to_string(),
            },
        );
        let report = WorkflowReport {
            workflow: "wf".to_string(),
            dry_run: false,
            outcomes,
        };
        assert!(!report.succeeded());
        assert_eq!(report.failed_tasks(), vec!["A"]);
    }
}
