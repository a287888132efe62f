//! Sandbox description handed out by a provisioned task.
//!
//! `SandboxInfo` is an immutable value object: once a sandbox is ready, the
//! staging layer and the driver only ever read it. Relocating a sandbox (as a
//! checkpoint does) produces a new value instead of mutating the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend identity of a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxHandle {
    /// Nothing beyond the working directory (batch, scheduler-backed).
    Directory,
    /// A running container.
    Container { id: String },
    /// A prepared Apptainer image with an optional writable overlay.
    Image {
        sif: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay: Option<String>,
    },
    /// A running pod.
    Pod { name: String, namespace: String },
}

/// Everything the core needs to know about a ready sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Globally unique identity: `<name>-<random>-<millis>`.
    pub id: String,
    /// Owning task name.
    pub task: String,
    /// Directory in which commands run, as seen inside the sandbox.
    pub working_dir: String,
    /// Host directory holding staging slots.
    pub staging_dir: String,
    /// Host co-location key (`local` or `user@host:port`).
    pub location: String,
    pub handle: SandboxHandle,
    pub created_at: DateTime<Utc>,
}

impl SandboxInfo {
    /// A copy of this sandbox rooted at `working_dir`, with the staging
    /// directory moved along when it lived inside the old root.
    pub fn relocated(&self, working_dir: impl Into<String>) -> Self {
        let working_dir = working_dir.into();
        let staging_dir = match self.staging_dir.strip_prefix(&self.working_dir) {
            Some(rest) => format!("{working_dir}{rest}"),
            None => self.staging_dir.clone(),
        };
        Self {
            working_dir,
            staging_dir,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SandboxInfo {
        SandboxInfo {
            id: "a-1234abcd-1700000000000".to_string(),
            task: "A".to_string(),
            working_dir: "/tmp/dagon/a-1234abcd-1700000000000".to_string(),
            staging_dir: "/tmp/dagon/a-1234abcd-1700000000000/.dagon/staging".to_string(),
            location: "local".to_string(),
            handle: SandboxHandle::Directory,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn relocated_moves_nested_staging_dir() {
        let info = sample();
        let moved = info.relocated("/tmp/dagon/a-checkpoint");
        assert_eq!(moved.working_dir, "/tmp/dagon/a-checkpoint");
        assert_eq!(moved.staging_dir, "/tmp/dagon/a-checkpoint/.dagon/staging");
        assert_eq!(moved.id, info.id);
    }

    #[test]
    fn relocated_keeps_external_staging_dir() {
        let mut info = sample();
        info.staging_dir = "/var/stage/a".to_string();
        let moved = info.relocated("/elsewhere");
        assert_eq!(moved.staging_dir, "/var/stage/a");
    }
}
