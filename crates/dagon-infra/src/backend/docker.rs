//! Long-lived containers driven through the `docker` CLI.
//!
//! The container idles on `sleep infinity` with the host working directory
//! bind-mounted at the same path, so file transfer is plain host I/O and every
//! command is a `docker exec`.

use std::time::Duration;

use chrono::Utc;
use dagon_core::channel::{ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};

use super::workdir;
use super::DriverSettings;

#[derive(Debug, Clone)]
pub struct DockerDriver<C> {
    channel: C,
    settings: DriverSettings,
    image: String,
    volumes: Vec<String>,
}

impl<C: CommandChannel> DockerDriver<C> {
    pub fn new(channel: C, settings: DriverSettings, image: impl Into<String>, volumes: Vec<String>) -> Self {
        Self {
            channel,
            settings,
            image: image.into(),
            volumes,
        }
    }

    fn run_argv(&self, name: &str, working_dir: &str) -> Vec<String> {
        let mut argv: Vec<String> = ["docker", "run", "-d", "-i", "--name", name]
            .into_iter()
            .map(String::from)
            .collect();
        argv.push("-v".to_string());
        argv.push(format!("{working_dir}:{working_dir}"));
        for volume in &self.volumes {
            argv.push("-v".to_string());
            argv.push(volume.clone());
        }
        argv.extend(["-w".to_string(), working_dir.to_string(), self.image.clone()]);
        argv.extend(["sleep".to_string(), "infinity".to_string()]);
        argv
    }

    fn container<'a>(&self, sandbox: &'a SandboxInfo) -> &'a str {
        match &sandbox.handle {
            SandboxHandle::Container { id } => id,
            _ => &sandbox.id,
        }
    }
}

impl<C: CommandChannel> SandboxDriver for DockerDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        let dirs = workdir::create(&self.channel, request, &self.settings.scratch_root).await?;

        tracing::debug!(task = %request.task, image = %self.image, "pulling image");
        workdir::run_checked(
            &self.channel,
            CommandRequest::new(["docker", "pull", self.image.as_str()])
                .timeout(self.settings.command_timeout),
            SandboxError::Provisioning,
        )
        .await?;

        workdir::run_checked(
            &self.channel,
            CommandRequest::new(self.run_argv(&request.id, &dirs.root))
                .timeout(self.settings.command_timeout),
            SandboxError::Provisioning,
        )
        .await?;

        Ok(SandboxInfo {
            id: request.id.clone(),
            task: request.task.clone(),
            working_dir: dirs.root,
            staging_dir: dirs.staging,
            location: self.channel.location(),
            handle: SandboxHandle::Container {
                id: request.id.clone(),
            },
            created_at: Utc::now(),
        })
    }

    async fn run(
        &self,
        sandbox: &SandboxInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ChannelOutput, SandboxError> {
        let request = CommandRequest::new([
            "docker",
            "exec",
            "-w",
            sandbox.working_dir.as_str(),
            self.container(sandbox),
            "bash",
            "-c",
            command,
        ])
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
        workdir::run_checked(
            &self.channel,
            CommandRequest::new(["docker", "rm", "-f", self.container(sandbox)])
                .timeout(self.settings.command_timeout),
            SandboxError::Cleanup,
        )
        .await?;
        workdir::remove(&self.channel, &sandbox.working_dir).await
    }

    /// Stop the container and keep only its bind-mounted directory.
    async fn persist(&self, sandbox: &SandboxInfo, suffix: &str) -> Result<SandboxInfo, SandboxError> {
        workdir::run_checked(
            &self.channel,
            CommandRequest::new(["docker", "rm", "-f", self.container(sandbox)])
                .timeout(self.settings.command_timeout),
            SandboxError::Cleanup,
        )
        .await?;
        let target = format!("{}{suffix}", sandbox.working_dir.trim_end_matches('/'));
        self.channel
            .rename(&sandbox.working_dir, &target)
            .await
            .map_err(|e| SandboxError::Cleanup(e.to_string()))?;
        Ok(SandboxInfo {
            handle: SandboxHandle::Directory,
            ..sandbox.relocated(target)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{output, ScriptedChannel};

    fn driver(channel: &ScriptedChannel) -> DockerDriver<ScriptedChannel> {
        DockerDriver::new(
            channel.clone(),
            DriverSettings::for_tests("/scratch"),
            "ubuntu:22.04",
            vec!["/data:/data:ro".to_string()],
        )
    }

    #[tokio::test]
    async fn create_pulls_and_starts_container() {
        let channel = ScriptedChannel::new("local");
        let driver = driver(&channel);
        let request = SandboxRequest::new("A", None);
        let sandbox = driver.create(&request).await.unwrap();

        let wd = format!("/scratch/{}", request.id);
        assert_eq!(sandbox.working_dir, wd);
        assert_eq!(sandbox.handle, SandboxHandle::Container { id: request.id.clone() });

        let argvs: Vec<Vec<String>> = channel.requests().into_iter().map(|r| r.argv).collect();
        assert_eq!(argvs.len(), 2);
        assert_eq!(argvs[0], ["docker", "pull", "ubuntu:22.04"]);
        let bind = format!("{wd}:{wd}");
        assert_eq!(
            argvs[1],
            [
                "docker", "run", "-d", "-i", "--name", request.id.as_str(), "-v", bind.as_str(),
                "-v", "/data:/data:ro", "-w", wd.as_str(), "ubuntu:22.04", "sleep", "infinity",
            ]
        );
    }

    #[tokio::test]
    async fn failed_pull_is_a_provisioning_error() {
        let channel = ScriptedChannel::new("local");
        channel.respond("docker pull", vec![output("", "manifest unknown", 1)]);
        let err = driver(&channel)
            .create(&SandboxRequest::new("A", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(m) if m.contains("manifest unknown")));
        assert!(!channel.commands().iter().any(|c| c.starts_with("docker run")));
    }

    #[tokio::test]
    async fn run_execs_in_working_directory() {
        let channel = ScriptedChannel::new("local");
        channel.respond("docker exec", vec![output("hi\n", "", 0)]);
        let driver = driver(&channel);
        let sandbox = driver.create(&SandboxRequest::new("A", None)).await.unwrap();

        let out = driver.run(&sandbox, "echo hi", Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.stdout, "hi\n");
        let last = channel.requests().pop().unwrap();
        assert_eq!(last.argv[..4], ["docker", "exec", "-w", sandbox.working_dir.as_str()]);
        assert_eq!(last.argv[5..], ["bash", "-c", "echo hi"]);
        assert_eq!(last.timeout, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn destroy_removes_container() {
        let channel = ScriptedChannel::new("local");
        let driver = driver(&channel);
        let sandbox = driver.create(&SandboxRequest::new("A", None)).await.unwrap();
        driver.destroy(&sandbox).await.unwrap();
        assert_eq!(
            channel.commands().last().unwrap(),
            &format!("docker rm -f {}", sandbox.id)
        );
    }

    #[tokio::test]
    async fn persist_releases_container_and_keeps_directory() {
        let channel = ScriptedChannel::new("local");
        let driver = driver(&channel);
        let sandbox = driver.create(&SandboxRequest::new("C1", None)).await.unwrap();
        let moved = driver.persist(&sandbox, "-checkpoint").await.unwrap();

        assert_eq!(moved.working_dir, format!("{}-checkpoint", sandbox.working_dir));
        assert_eq!(moved.handle, SandboxHandle::Directory);
        assert_eq!(
            channel.commands().last().unwrap(),
            &format!("docker rm -f {}", sandbox.id)
        );
    }
}
