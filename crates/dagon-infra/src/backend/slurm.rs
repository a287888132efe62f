//! Commands dispatched to an HPC resource manager with `srun`.
//!
//! The working directory sits on the filesystem shared by the login and
//! compute nodes, so files are host files.

use std::time::Duration;

use chrono::Utc;
use dagon_core::channel::{ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};

use super::workdir;
use super::DriverSettings;

/// Queueing chatter printed by `srun` on stderr.
pub const NOISE_MARKERS: &[&str] = &["srun:"];

#[derive(Debug, Clone)]
pub struct SlurmDriver<C> {
    channel: C,
    settings: DriverSettings,
    partition: Option<String>,
    ntasks: u32,
    memory_mb: Option<u32>,
}

impl<C: CommandChannel> SlurmDriver<C> {
    pub fn new(
        channel: C,
        settings: DriverSettings,
        partition: Option<String>,
        ntasks: u32,
        memory_mb: Option<u32>,
    ) -> Self {
        Self {
            channel,
            settings,
            partition,
            ntasks,
            memory_mb,
        }
    }

    fn srun_argv(&self, working_dir: &str, command: &str) -> Vec<String> {
        let mut argv = vec!["srun".to_string()];
        if let Some(partition) = &self.partition {
            argv.extend(["--partition".to_string(), partition.clone()]);
        }
        argv.extend(["--ntasks".to_string(), self.ntasks.to_string()]);
        if let Some(mem) = self.memory_mb {
            argv.extend(["--mem".to_string(), format!("{mem}M")]);
        }
        argv.extend(["--chdir".to_string(), working_dir.to_string()]);
        argv.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        argv
    }
}

impl<C: CommandChannel> SandboxDriver for SlurmDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        let dirs = workdir::create(&self.channel, request, &self.settings.scratch_root).await?;
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
        let request = CommandRequest::new(self.srun_argv(&sandbox.working_dir, command)).timeout(timeout);
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

    fn noise_markers(&self) -> &'static [&'static str] {
        NOISE_MARKERS
    }
}
