//! Plain shell execution in a host directory.

use std::time::Duration;

use chrono::Utc;
use dagon_core::channel::{ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};

use super::workdir;

#[derive(Debug, Clone)]
pub struct BatchDriver<C> {
    channel: C,
    scratch_root: String,
}

impl<C: CommandChannel> BatchDriver<C> {
    pub fn new(channel: C, scratch_root: impl Into<String>) -> Self {
        Self {
            channel,
            scratch_root: scratch_root.into(),
        }
    }
}

impl<C: CommandChannel> SandboxDriver for BatchDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        let dirs = workdir::create(&self.channel, request, &self.scratch_root).await?;
        Ok(SandboxInfo {
            id: request.id.clone(),
            task: request.task.clone(),
            working_dir: dirs.root,
            staging_dir: dirs.staging,
            location: self.channel.location(),
            handle: SandboxHandle::Directory,
            created_at: Utc::now(),
        })
    }

    async fn run(
        &self,
        sandbox: &SandboxInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ChannelOutput, SandboxError> {
        let request = CommandRequest::shell(command)
            .cwd(sandbox.working_dir.clone())
            .timeout(timeout);
        Ok(self.channel.execute(request).await?)
    }

    async fn read_file(&self, sandbox: &SandboxInfo, path: &str) -> Result<Vec<u8>, SandboxError> {
        workdir::read(&self.channel, sandbox, path).await
    }

    async fn write_file(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        workdir::write(&self.channel, sandbox, path, bytes).await
    }

    async fn destroy(&self, sandbox: &SandboxInfo) -> Result<(), SandboxError> {
        workdir::remove(&self.channel, &sandbox.working_dir).await
    }
}
