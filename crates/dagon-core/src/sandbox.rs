//! Sandbox driver port.
//!
//! A driver owns the lifecycle of one backend's execution units: it creates a
//! sandbox, runs commands in it, moves files in and out of it and destroys it.
//! Every operation goes through the driver's [`CommandChannel`], so the same
//! driver type serves local and remote placement.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};
use uuid::Uuid;

use crate::channel::{join_path, ChannelError, ChannelOutput, CommandChannel};

/// Directory (relative to a sandbox root) holding staging slots.
pub const STAGING_DIR: &str = ".dagon/staging";

/// Directory (relative to a sandbox root) receiving imported references.
pub const INPUTS_DIR: &str = ".dagon/inputs";

/// Suffix appended to a checkpoint sandbox's directory when it is persisted.
pub const CHECKPOINT_SUFFIX: &str = "-checkpoint";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced at the driver boundary.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("staging failed for '{path}': {message}")]
    Staging { path: String, message: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend command failed: {0}")]
    Command(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error(transparent)]
    Channel(ChannelError),
}

impl From<ChannelError> for SandboxError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout { after } => Self::Timeout(after),
            other => Self::Channel(other),
        }
    }
}

impl SandboxError {
    pub fn staging(path: &str, err: impl std::fmt::Display) -> Self {
        Self::Staging {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What a driver needs to provision a sandbox for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRequest {
    pub task: String,
    /// Pre-generated identity (see [`sandbox_id`]).
    pub id: String,
    /// Fixed working directory; drivers generate one under their scratch root otherwise.
    pub working_dir: Option<String>,
}

impl SandboxRequest {
    pub fn new(task: &str, working_dir: Option<String>) -> Self {
        Self {
            task: task.to_string(),
            id: sandbox_id(task),
            working_dir,
        }
    }

    /// `working_dir` or `<root>/<id>`.
    pub fn working_dir_under(&self, root: &str) -> String {
        match &self.working_dir {
            Some(dir) => dir.clone(),
            None => join_path(root, &self.id),
        }
    }
}

/// Globally unique sandbox identity: sanitized name, random suffix, millisecond timestamp.
///
/// The result is a valid DNS-1123 label prefix (lowercase alphanumerics and `-`).
pub fn sandbox_id(name: &str) -> String {
    let mut base: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    base.truncate(32);
    let base = base.trim_matches('-');
    let base = if base.is_empty() { "task" } else { base };
    let random = Uuid::new_v4().simple().to_string();
    format!("{base}-{}-{}", &random[..8], Utc::now().timestamp_millis())
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One backend's sandbox lifecycle.
pub trait SandboxDriver: Send + Sync + 'static {
    type Channel: CommandChannel;

    /// Channel to the host the backend tooling runs on.
    fn channel(&self) -> &Self::Channel;

    fn kind(&self) -> BackendKind;

    /// Provision a ready sandbox. Not required to be idempotent: callers serialize.
    fn create(
        &self,
        request: &SandboxRequest,
    ) -> impl Future<Output = Result<SandboxInfo, SandboxError>> + Send;

    /// Run `command` inside the sandbox with its working directory as cwd.
    fn run(
        &self,
        sandbox: &SandboxInfo,
        command: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<ChannelOutput, SandboxError>> + Send;

    /// Read a file; relative paths are resolved against the working directory.
    fn read_file(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SandboxError>> + Send;

    /// Write a file, creating parent directories inside the sandbox.
    fn write_file(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SandboxError>> + Send;

    fn destroy(&self, sandbox: &SandboxInfo)
    -> impl Future<Output = Result<(), SandboxError>> + Send;

    /// Lines of backend runtime chatter to drop from stderr.
    fn noise_markers(&self) -> &'static [&'static str] {
        &[]
    }

    /// Copy `path` out of the sandbox into the staging slot `slot`.
    ///
    /// Returns the slot's host path. The slot is byte-identical to the source.
    fn export(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
        slot: &str,
    ) -> impl Future<Output = Result<String, SandboxError>> + Send {
        async move {
            let bytes = self.read_file(sandbox, path).await?;
            let slot_path = join_path(&sandbox.staging_dir, slot);
            self.channel()
                .write_file(&slot_path, &bytes)
                .await
                .map_err(|e| SandboxError::staging(&slot_path, e))?;
            Ok(slot_path)
        }
    }

    /// Copy a staging slot on the host into the sandbox at `path`.
    fn import(
        &self,
        sandbox: &SandboxInfo,
        slot_path: &str,
        path: &str,
    ) -> impl Future<Output = Result<(), SandboxError>> + Send {
        async move {
            let bytes = self
                .channel()
                .read_file(slot_path)
                .await
                .map_err(|e| SandboxError::staging(slot_path, e))?;
            self.write_file(sandbox, path, &bytes).await
        }
    }

    /// Re-open a sandbox whose working directory survived a previous run.
    fn attach(
        &self,
        task: &str,
        working_dir: &str,
    ) -> impl Future<Output = Result<SandboxInfo, SandboxError>> + Send {
        async move {
            let channel = self.channel();
            if !channel.exists(working_dir).await? {
                return Err(SandboxError::Provisioning(format!(
                    "persisted directory '{working_dir}' does not exist"
                )));
            }
            let staging_dir = join_path(working_dir, STAGING_DIR);
            channel.create_dir(&staging_dir).await?;
            Ok(SandboxInfo {
                id: working_dir
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or(task)
                    .to_string(),
                task: task.to_string(),
                working_dir: working_dir.to_string(),
                staging_dir,
                location: channel.location(),
                handle: SandboxHandle::Directory,
                created_at: Utc::now(),
            })
        }
    }

    /// Rename the sandbox's host directory to `<dir><suffix>` and return the
    /// relocated sandbox.
    fn persist(
        &self,
        sandbox: &SandboxInfo,
        suffix: &str,
    ) -> impl Future<Output = Result<SandboxInfo, SandboxError>> + Send {
        async move {
            let target = format!("{}{}", sandbox.working_dir.trim_end_matches('/'), suffix);
            self.channel()
                .rename(&sandbox.working_dir, &target)
                .await
                .map_err(|e| SandboxError::Cleanup(e.to_string()))?;
            Ok(sandbox.relocated(target))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_id_is_sanitized_and_unique() {
        let a = sandbox_id("Checkpoint_1");
        let b = sandbox_id("Checkpoint_1");
        assert!(a.starts_with("checkpoint-1-"));
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn sandbox_id_falls_back_for_symbol_only_names() {
        assert!(sandbox_id("__").starts_with("task-"));
    }

    #[test]
    fn request_working_dir_prefers_fixed_directory() {
        let req = SandboxRequest::new("A", Some("/data/a".to_string()));
        assert_eq!(req.working_dir_under("/tmp/dagon"), "/data/a");

        let req = SandboxRequest::new("A", None);
        assert_eq!(req.working_dir_under("/tmp/dagon"), format!("/tmp/dagon/{}", req.id));
    }

    #[test]
    fn channel_timeout_maps_to_sandbox_timeout() {
        let err: SandboxError = ChannelError::Timeout {
            after: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_secs(3)));
    }
}
