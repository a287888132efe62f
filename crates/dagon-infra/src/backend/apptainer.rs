//! Apptainer images with a writable overlay.
//!
//! Provisioning prepares a SIF image (an existing `.sif` path or a build from
//! any other image reference), then a local overlay image. Commands run with
//! the working directory bound at the same path and the staging directory at
//! `/staging`.

use std::time::Duration;

use chrono::Utc;
use dagon_core::channel::{join_path, ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};

use super::workdir;
use super::DriverSettings;

/// Runtime chatter Apptainer and its FUSE helpers print on stderr.
pub const NOISE_MARKERS: &[&str] = &[
    "squashfuse",
    "fuse2fs",
    "gocryptfs",
    "Converting SIF",
    "Cleaning up image",
];

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "operation not permitted",
    "must be root",
    "requires root",
    "fakeroot",
];

/// Whether a failed build looks like it lacked privileges.
pub fn is_permission_failure(message: &str) -> bool {
    let message = message.to_lowercase();
    PERMISSION_MARKERS.iter().any(|m| message.contains(m))
}

#[derive(Debug, Clone)]
pub struct ApptainerDriver<C> {
    channel: C,
    settings: DriverSettings,
    image: String,
    bind_paths: Vec<String>,
    overlay_size_mb: u32,
    remote: bool,
}

impl<C: CommandChannel> ApptainerDriver<C> {
    pub fn new(
        channel: C,
        settings: DriverSettings,
        image: impl Into<String>,
        bind_paths: Vec<String>,
        overlay_size_mb: u32,
        remote: bool,
    ) -> Self {
        Self {
            channel,
            settings,
            image: image.into(),
            bind_paths,
            overlay_size_mb,
            remote,
        }
    }

    async fn prepare_image(&self, request: &SandboxRequest, working_dir: &str) -> Result<String, SandboxError> {
        if self.image.ends_with(".sif") {
            if !self.channel.exists(&self.image).await? {
                return Err(SandboxError::Provisioning(format!(
                    "SIF file not found: {}",
                    self.image
                )));
            }
            tracing::debug!(task = %request.task, sif = %self.image, "using existing image");
            return Ok(self.image.clone());
        }

        let sif = join_path(working_dir, &format!(".dagon/{}.sif", request.id));
        let build = CommandRequest::new(["apptainer", "build", sif.as_str(), self.image.as_str()])
            .timeout(self.settings.command_timeout);
        tracing::info!(task = %request.task, image = %self.image, sif = %sif, "building image");

        let output = self.channel.execute(build.clone()).await?;
        if !output.success() {
            let message = output.message();
            if self.remote || !is_permission_failure(&message) {
                return Err(SandboxError::Provisioning(format!(
                    "apptainer build failed with code {}: {message}",
                    output.code
                )));
            }
            tracing::warn!(task = %request.task, error = %message, "image build lacks privileges, retrying with sudo");
            workdir::run_checked(&self.channel, build.prefixed(["sudo"]), SandboxError::Provisioning).await?;
        }

        if self.remote && !self.channel.exists(&sif).await? {
            return Err(SandboxError::Provisioning(format!(
                "image build reported success but {sif} is missing"
            )));
        }
        Ok(sif)
    }

    async fn create_overlay(&self, request: &SandboxRequest, working_dir: &str) -> Result<Option<String>, SandboxError> {
        if self.remote {
            return Ok(None);
        }
        let overlay = join_path(working_dir, &format!(".dagon/overlay_{}.img", request.id));
        workdir::run_checked(
            &self.channel,
            CommandRequest::new([
                "apptainer".to_string(),
                "overlay".to_string(),
                "create".to_string(),
                "--size".to_string(),
                self.overlay_size_mb.to_string(),
                overlay.clone(),
            ])
            .timeout(self.settings.command_timeout),
            SandboxError::Provisioning,
        )
        .await?;
        Ok(Some(overlay))
    }

    /// `apptainer exec` prefix up to and including the image.
    fn exec_argv(&self, sandbox: &SandboxInfo, with_overlay: bool) -> Vec<String> {
        let (sif, overlay) = match &sandbox.handle {
            SandboxHandle::Image { sif, overlay } => (sif.clone(), overlay.clone()),
            _ => (self.image.clone(), None),
        };
        let mut argv = vec!["apptainer".to_string(), "exec".to_string()];
        if let (true, Some(overlay)) = (with_overlay, overlay) {
            argv.extend(["--overlay".to_string(), overlay]);
        }
        for bind in &self.bind_paths {
            argv.extend(["--bind".to_string(), bind.clone()]);
        }
        argv.extend([
            "--bind".to_string(),
            format!("{0}:{0}", sandbox.working_dir),
            "--bind".to_string(),
            format!("{}:/staging", sandbox.staging_dir),
            "--pwd".to_string(),
            sandbox.working_dir.clone(),
            sif,
        ]);
        argv
    }
}

impl<C: CommandChannel> SandboxDriver for ApptainerDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Apptainer
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        let dirs = workdir::create(&self.channel, request, &self.settings.scratch_root).await?;
        let sif = self.prepare_image(request, &dirs.root).await?;
        let overlay = self.create_overlay(request, &dirs.root).await?;

        Ok(SandboxInfo {
            id: request.id.clone(),
            task: request.task.clone(),
            working_dir: dirs.root,
            staging_dir: dirs.staging,
            location: self.channel.location(),
            handle: SandboxHandle::Image { sif, overlay },
            created_at: Utc::now(),
        })
    }

    async fn run(
        &self,
        sandbox: &SandboxInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ChannelOutput, SandboxError> {
        let mut argv = self.exec_argv(sandbox, true);
        argv.extend(["bash".to_string(), "-c".to_string(), command.to_string()]);
        Ok(self.channel.execute(CommandRequest::new(argv).timeout(timeout)).await?)
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

    /// Paths outside the bound working directory only exist inside the
    /// container, so they are copied out with an in-container `cp` (without
    /// the overlay, which cannot be mounted twice).
    async fn export(&self, sandbox: &SandboxInfo, path: &str, slot: &str) -> Result<String, SandboxError> {
        let slot_path = join_path(&sandbox.staging_dir, slot);
        let inside_workdir = !path.starts_with('/') || path.starts_with(&format!("{}/", sandbox.working_dir));
        if inside_workdir {
            let bytes = self.read_file(sandbox, path).await?;
            self.channel
                .write_file(&slot_path, &bytes)
                .await
                .map_err(|e| SandboxError::staging(&slot_path, e))?;
            return Ok(slot_path);
        }

        let mut argv = self.exec_argv(sandbox, false);
        argv.extend(["cp".to_string(), path.to_string(), format!("/staging/{slot}")]);
        let output = self
            .channel
            .execute(CommandRequest::new(argv).timeout(self.settings.command_timeout))
            .await?;
        if !output.success() || !self.channel.exists(&slot_path).await? {
            return Err(SandboxError::staging(
                path,
                format!("could not export to staging: {}", output.message()),
            ));
        }
        Ok(slot_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{output, ScriptedChannel};

    fn driver(channel: &ScriptedChannel, image: &str, remote: bool) -> ApptainerDriver<ScriptedChannel> {
        ApptainerDriver::new(
            channel.clone(),
            DriverSettings::for_tests("/scratch"),
            image,
            vec!["/opt/data".to_string()],
            512,
            remote,
        )
    }

    #[test]
    fn permission_failures_are_recognised() {
        assert!(is_permission_failure("FATAL: Unable to build: Permission denied"));
        assert!(is_permission_failure("while performing build: operation not permitted"));
        assert!(!is_permission_failure("FATAL: no such image"));
    }

    #[tokio::test]
    async fn local_build_retries_once_with_sudo() {
        let channel = ScriptedChannel::new("local");
        channel.respond(
            "apptainer build",
            vec![
                output("", "FATAL: permission denied", 255),
                output("", "", 0),
            ],
        );
        let driver = driver(&channel, "docker://ubuntu:20.04", false);
        let request = SandboxRequest::new("A", None);
        let sandbox = driver.create(&request).await.unwrap();

        let builds: Vec<String> = channel
            .commands()
            .into_iter()
            .filter(|c| c.contains("apptainer build"))
            .collect();
        assert_eq!(builds.len(), 2);
        assert!(builds[0].starts_with("apptainer build"));
        assert!(builds[1].starts_with("sudo apptainer build"));

        let wd = format!("/scratch/{}", request.id);
        assert_eq!(
            sandbox.handle,
            SandboxHandle::Image {
                sif: format!("{wd}/.dagon/{}.sif", request.id),
                overlay: Some(format!("{wd}/.dagon/overlay_{}.img", request.id)),
            }
        );
        assert!(channel.commands().iter().any(|c| c.contains("apptainer overlay create --size 512")));
    }

    #[tokio::test]
    async fn privileged_retry_failure_is_permanent() {
        let channel = ScriptedChannel::new("local");
        channel.respond("apptainer build", vec![output("", "permission denied", 1)]);
        let err = driver(&channel, "docker://ubuntu:20.04", false)
            .create(&SandboxRequest::new("A", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Provisioning(_)));
        let builds = channel.commands().into_iter().filter(|c| c.contains("apptainer build")).count();
        assert_eq!(builds, 2);
    }

    #[tokio::test]
    async fn other_build_failures_are_not_retried() {
        let channel = ScriptedChannel::new("local");
        channel.respond("apptainer build", vec![output("", "FATAL: manifest unknown", 1)]);
        let err = driver(&channel, "docker://nope:1", false)
            .create(&SandboxRequest::new("A", None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("manifest unknown"));
        assert!(!channel.commands().iter().any(|c| c.starts_with("sudo")));
    }

    #[tokio::test]
    async fn remote_build_is_verified_and_has_no_overlay() {
        let channel = ScriptedChannel::new("hpc@cluster:22");
        let driver = driver(&channel, "docker://ubuntu:20.04", true);
        // The scripted build "succeeds" but never writes the image.
        let err = driver.create(&SandboxRequest::new("A", None)).await.unwrap_err();
        assert!(err.to_string().contains("is missing"));
        assert!(!channel.commands().iter().any(|c| c.contains("overlay create")));
    }

    #[tokio::test]
    async fn missing_sif_is_rejected() {
        let channel = ScriptedChannel::new("local");
        let err = driver(&channel, "/images/tool.sif", false)
            .create(&SandboxRequest::new("A", None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SIF file not found"));
    }

    #[tokio::test]
    async fn run_binds_workdir_staging_and_overlay() {
        let channel = ScriptedChannel::new("local");
        channel.write_file("/images/tool.sif", b"sif").await.unwrap();
        let driver = driver(&channel, "/images/tool.sif", false);
        let sandbox = driver.create(&SandboxRequest::new("A", None)).await.unwrap();

        driver.run(&sandbox, "ls", Duration::from_secs(5)).await.unwrap();
        let argv = channel.requests().pop().unwrap().argv;
        let wd = &sandbox.working_dir;
        assert_eq!(argv[..3], ["apptainer", "exec", "--overlay"]);
        assert_eq!(argv[4..6], ["--bind", "/opt/data"]);
        let bind_wd = format!("{wd}:{wd}");
        let bind_staging = format!("{}:/staging", sandbox.staging_dir);
        assert_eq!(
            argv[6..],
            [
                "--bind", bind_wd.as_str(), "--bind", bind_staging.as_str(), "--pwd", wd.as_str(),
                "/images/tool.sif", "bash", "-c", "ls",
            ]
        );
    }

    #[test]
    fn noise_is_filtered_but_user_stderr_kept() {
        let stderr = "INFO:    Converting SIF file to temporary sandbox...\nuser warning\nWARNING: squashfuse not found\n";
        assert_eq!(dagon_core::escape::strip_noise(stderr, NOISE_MARKERS), "user warning");
    }

    #[test]
    fn user_log_prefixes_survive_filtering() {
        let stderr = "WARNING: input file is empty\nINFO: processed 0 rows\nINFO:    Cleaning up image...\n";
        assert_eq!(
            dagon_core::escape::strip_noise(stderr, NOISE_MARKERS),
            "WARNING: input file is empty\nINFO: processed 0 rows"
        );
    }
}
