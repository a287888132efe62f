//! Pods kept alive with `sleep infinity` and driven through `kubectl`.
//!
//! The pod filesystem is not shared with the host, so files move through
//! `kubectl exec` (base64 out, stdin in). Staging slots still live on the host
//! under the scratch root.

use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use dagon_core::channel::{join_path, parent_dir, ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::escape::quote;
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};
use serde_json::json;

use super::workdir;
use super::DriverSettings;

/// Working directory inside the pod when the task does not fix one.
pub const POD_WORKDIR: &str = "/work";

#[derive(Debug, Clone)]
pub struct KubernetesDriver<C> {
    channel: C,
    settings: DriverSettings,
    image: String,
    namespace: String,
}

/// Pod manifest submitted with `kubectl apply -f -`.
pub fn pod_manifest(name: &str, namespace: &str, image: &str, task: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { "app": "dagon", "dagon-task": task_label(task) },
        },
        "spec": {
            "containers": [{
                "name": "main",
                "image": image,
                "command": ["sleep", "infinity"],
            }],
            "restartPolicy": "Never",
        },
    })
}

// Label values allow alphanumerics, '-', '_' and '.', at most 63 characters.
fn task_label(task: &str) -> String {
    let mut label: String = task
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '-' })
        .collect();
    label.truncate(63);
    label
}

impl<C: CommandChannel> KubernetesDriver<C> {
    pub fn new(
        channel: C,
        settings: DriverSettings,
        image: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            settings,
            image: image.into(),
            namespace: namespace.into(),
        }
    }

    fn pod<'a>(&'a self, sandbox: &'a SandboxInfo) -> (&'a str, &'a str) {
        match &sandbox.handle {
            SandboxHandle::Pod { name, namespace } => (name.as_str(), namespace.as_str()),
            _ => (sandbox.id.as_str(), self.namespace.as_str()),
        }
    }

    fn kubectl_exec(&self, sandbox: &SandboxInfo, script: String, stdin: bool) -> CommandRequest {
        let (name, namespace) = self.pod(sandbox);
        let mut argv = vec!["kubectl", "exec"];
        if stdin {
            argv.push("-i");
        }
        argv.extend([name, "-n", namespace, "--", "bash", "-c"]);
        CommandRequest::new(argv.into_iter().map(String::from).chain([script]))
    }

    async fn phase(&self, name: &str) -> Result<String, SandboxError> {
        let output = workdir::run_checked(
            &self.channel,
            CommandRequest::new([
                "kubectl",
                "get",
                "pod",
                name,
                "-n",
                self.namespace.as_str(),
                "-o",
                "jsonpath={.status.phase}",
            ])
            .timeout(self.settings.command_timeout),
            SandboxError::Provisioning,
        )
        .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn wait_until_running(&self, name: &str) -> Result<(), SandboxError> {
        let started = tokio::time::Instant::now();
        loop {
            let phase = self.phase(name).await?;
            match phase.as_str() {
                "Running" => return Ok(()),
                "Failed" | "Succeeded" => {
                    return Err(SandboxError::Provisioning(format!(
                        "pod {name} entered phase {phase} before becoming ready"
                    )));
                }
                _ => {}
            }
            if started.elapsed() >= self.settings.ready_timeout {
                return Err(SandboxError::Provisioning(format!(
                    "pod {name} not running after {:?} (phase '{phase}')",
                    self.settings.ready_timeout
                )));
            }
            tracing::trace!(pod = %name, phase = %phase, "waiting for pod");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn delete_pod(&self, name: &str, namespace: &str) -> Result<(), SandboxError> {
        let graceful = CommandRequest::new([
            "kubectl",
            "delete",
            "pod",
            name,
            "-n",
            namespace,
            "--grace-period=30",
        ])
        .timeout(self.settings.command_timeout);
        let output = self.channel.execute(graceful).await?;
        if output.success() {
            return Ok(());
        }

        tracing::warn!(pod = %name, error = %output.message(), "graceful pod deletion failed, forcing");
        workdir::run_checked(
            &self.channel,
            CommandRequest::new([
                "kubectl",
                "delete",
                "pod",
                name,
                "-n",
                namespace,
                "--force",
                "--grace-period=0",
            ])
            .timeout(self.settings.command_timeout),
            SandboxError::Cleanup,
        )
        .await?;
        Ok(())
    }
}

impl<C: CommandChannel> SandboxDriver for KubernetesDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        // Host side only holds staging slots; the fixed working dir applies inside the pod.
        let host = SandboxRequest {
            working_dir: None,
            ..request.clone()
        };
        let dirs = workdir::create(&self.channel, &host, &self.settings.scratch_root).await?;

        let manifest = pod_manifest(&request.id, &self.namespace, &self.image, &request.task);
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| SandboxError::Provisioning(format!("cannot encode pod manifest: {e}")))?;
        tracing::debug!(task = %request.task, pod = %request.id, namespace = %self.namespace, "creating pod");
        workdir::run_checked(
            &self.channel,
            CommandRequest::new(["kubectl", "apply", "-n", self.namespace.as_str(), "-f", "-"])
                .stdin(body)
                .timeout(self.settings.command_timeout),
            SandboxError::Provisioning,
        )
        .await?;

        if let Err(e) = self.wait_until_running(&request.id).await {
            if let Err(cleanup) = self.delete_pod(&request.id, &self.namespace).await {
                tracing::warn!(pod = %request.id, error = %cleanup, "failed to delete unready pod");
            }
            return Err(e);
        }

        Ok(SandboxInfo {
            id: request.id.clone(),
            task: request.task.clone(),
            working_dir: request
                .working_dir
                .clone()
                .unwrap_or_else(|| POD_WORKDIR.to_string()),
            staging_dir: dirs.staging,
            location: self.channel.location(),
            handle: SandboxHandle::Pod {
                name: request.id.clone(),
                namespace: self.namespace.clone(),
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
        let wd = quote(&sandbox.working_dir);
        let script = format!("mkdir -p {wd} && cd {wd} && {command}");
        let request = self.kubectl_exec(sandbox, script, false).timeout(timeout);
        Ok(self.channel.execute(request).await?)
    }

    async fn read_file(&self, sandbox: &SandboxInfo, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full = join_path(&sandbox.working_dir, path);
        let request = self
            .kubectl_exec(sandbox, format!("base64 -w0 {}", quote(&full)), false)
            .timeout(self.settings.command_timeout);
        let output = self.channel.execute(request).await?;
        if !output.success() {
            return Err(SandboxError::staging(&full, output.message()));
        }
        let encoded: String = output.stdout.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SandboxError::staging(&full, e))
    }

    async fn write_file(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        let full = join_path(&sandbox.working_dir, path);
        let mkdir = parent_dir(&full)
            .map(|dir| format!("mkdir -p {} && ", quote(dir)))
            .unwrap_or_default();
        let request = self
            .kubectl_exec(sandbox, format!("{mkdir}cat > {}", quote(&full)), true)
            .stdin(bytes.to_vec())
            .timeout(self.settings.command_timeout);
        let output = self.channel.execute(request).await?;
        if !output.success() {
            return Err(SandboxError::staging(&full, output.message()));
        }
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxInfo) -> Result<(), SandboxError> {
        let (name, namespace) = self.pod(sandbox);
        self.delete_pod(name, namespace).await?;
        let host_dir = join_path(&self.settings.scratch_root, &sandbox.id);
        workdir::remove(&self.channel, &host_dir).await
    }

    async fn attach(&self, task: &str, working_dir: &str) -> Result<SandboxInfo, SandboxError> {
        Err(SandboxError::Provisioning(format!(
            "cannot re-attach task '{task}' to '{working_dir}': pods do not outlive a run"
        )))
    }

    async fn persist(&self, sandbox: &SandboxInfo, _suffix: &str) -> Result<SandboxInfo, SandboxError> {
        Err(SandboxError::Cleanup(format!(
            "pod {} cannot be persisted as a checkpoint",
            sandbox.id
        )))
    }
}
