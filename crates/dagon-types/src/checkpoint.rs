//! Checkpoint file format.
//!
//! A checkpoint file is a flat JSON object keyed by `<workflow>.<task>`:
//!
//! ```json
//! {
//!   "DataFlow-Demo.Checkpoint_1": {
//!     "working_dir": "/tmp/dagon/checkpoint_1-3fa2c1d9-1718000000000-checkpoint",
//!     "recorded_at": "2024-06-10T08:00:00Z"
//!   }
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recovery metadata for one completed checkpoint task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Persistent (renamed) working directory of the checkpoint sandbox.
    pub working_dir: String,
    /// Host co-location key of the directory (`local` when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// All records of one checkpoint file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointFile {
    records: BTreeMap<String, CheckpointRecord>,
}

impl CheckpointFile {
    /// Record key for a task of a workflow.
    pub fn key(workflow: &str, task: &str) -> String {
        format!("{workflow}.{task}")
    }

    pub fn get(&self, workflow: &str, task: &str) -> Option<&CheckpointRecord> {
        self.records.get(&Self::key(workflow, task))
    }

    /// Insert or replace the record of `workflow.task`.
    pub fn insert(&mut self, workflow: &str, task: &str, record: CheckpointRecord) {
        self.records.insert(Self::key(workflow, task), record);
    }

    /// Copy every record of `other` into `self`; `other` wins on conflicts.
    pub fn merge(&mut self, other: CheckpointFile) {
        self.records.extend(other.records);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CheckpointRecord)> {
        self.records.iter()
    }
}
