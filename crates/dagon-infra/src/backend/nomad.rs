//! One Nomad batch job per command, submitted through the HTTP API.
//!
//! The job runs the container driver with the sandbox working directory
//! bind-mounted at the same path, so files are plain host files as long as the
//! Nomad client shares the channel host's filesystem.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use dagon_core::channel::{ChannelOutput, CommandChannel};
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::workdir;
use super::DriverSettings;

/// Name of the single task inside every submitted job.
pub const TASK_NAME: &str = "main";

/// Default agent port.
pub const NOMAD_PORT: u16 = 4646;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Resources and placement of submitted jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NomadJob {
    pub image: String,
    pub datacenter: String,
    pub region: String,
    pub cpu: u32,
    pub memory_mb: u32,
    pub network_mode: String,
}

#[derive(Debug, Clone)]
pub struct NomadDriver<C> {
    channel: C,
    settings: DriverSettings,
    job: NomadJob,
    address: String,
    http: reqwest::Client,
}

// ---------------------------------------------------------------------------
// API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobStatus {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Allocation {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub task_states: HashMap<String, TaskState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskEvent {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Job registration body for `POST /v1/jobs`.
pub fn job_spec(id: &str, command: &str, working_dir: &str, job: &NomadJob) -> serde_json::Value {
    json!({
        "Job": {
            "ID": id,
            "Name": id,
            "Type": "batch",
            "Priority": 50,
            "Datacenters": [job.datacenter],
            "Region": job.region,
            "TaskGroups": [{
                "Name": "dagon",
                "Count": 1,
                "RestartPolicy": { "Attempts": 0, "Mode": "fail" },
                "ReschedulePolicy": { "Attempts": 0, "Unlimited": false },
                "Tasks": [{
                    "Name": TASK_NAME,
                    "Driver": "docker",
                    "Config": {
                        "image": job.image,
                        "command": "bash",
                        "args": ["-c", command],
                        "work_dir": working_dir,
                        "volumes": [format!("{working_dir}:{working_dir}")],
                        "network_mode": job.network_mode,
                    },
                    "Resources": { "CPU": job.cpu, "MemoryMB": job.memory_mb },
                    "LogConfig": { "MaxFiles": 2, "MaxFileSizeMB": 10 },
                }],
            }],
        }
    })
}

/// Exit code of the finished job: the `Terminated` event of the first
/// allocation's task, or 1 when the job died without one.
pub fn exit_code(allocations: &[Allocation]) -> i32 {
    allocations
        .first()
        .and_then(|alloc| alloc.task_states.get(TASK_NAME))
        .filter(|state| state.state == "dead")
        .and_then(|state| state.events.iter().rev().find(|e| e.kind == "Terminated"))
        .map(|event| event.exit_code.unwrap_or(1))
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

impl<C: CommandChannel> NomadDriver<C> {
    pub fn new(channel: C, settings: DriverSettings, job: NomadJob, address: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("dagon/0.1")
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            channel,
            settings,
            job,
            address: address.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn submit(&self, id: &str, command: &str, working_dir: &str) -> Result<(), SandboxError> {
        let url = format!("{}/v1/jobs", self.address);
        self.http
            .post(&url)
            .json(&job_spec(id, command, working_dir, &self.job))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SandboxError::Command(format!("job submission to {url} failed: {e}")))?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SandboxError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| SandboxError::Command(format!("GET {url} failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| SandboxError::Command(format!("unreadable response from {url}: {e}")))
    }

    async fn wait_until_dead(&self, id: &str, timeout: Duration) -> Result<(), SandboxError> {
        let url = format!("{}/v1/job/{id}", self.address);
        let started = tokio::time::Instant::now();
        loop {
            let status: JobStatus = self.get_json(&url).await?;
            if status.status == "dead" {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(SandboxError::Timeout(timeout));
            }
            tracing::trace!(job = %id, status = %status.status, "waiting for job");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn log(&self, alloc: &str, stream: &str) -> String {
        let url = format!(
            "{}/v1/client/fs/logs/{alloc}?task={TASK_NAME}&type={stream}&plain=true",
            self.address
        );
        let fetched = match self.http.get(&url).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => response.text().await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        fetched.unwrap_or_else(|e| {
            tracing::warn!(alloc = %alloc, stream = %stream, error = %e, "failed to fetch job log");
            String::new()
        })
    }

    async fn purge(&self, id: &str) {
        let url = format!("{}/v1/job/{id}?purge=true", self.address);
        let result = self
            .http
            .delete(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        if let Err(e) = result {
            tracing::warn!(job = %id, error = %e, "failed to purge job");
        }
    }

    async fn collect(&self, id: &str, timeout: Duration) -> Result<ChannelOutput, SandboxError> {
        self.wait_until_dead(id, timeout).await?;
        let allocations: Vec<Allocation> = self
            .get_json(&format!("{}/v1/job/{id}/allocations", self.address))
            .await?;
        let code = exit_code(&allocations);
        let (stdout, stderr) = match allocations.first() {
            Some(alloc) => (self.log(&alloc.id, "stdout").await, self.log(&alloc.id, "stderr").await),
            None => (String::new(), format!("job {id} finished without an allocation")),
        };
        Ok(ChannelOutput { stdout, stderr, code })
    }
}

impl<C: CommandChannel> SandboxDriver for NomadDriver<C> {
    type Channel = C;

    fn channel(&self) -> &C {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Nomad
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
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", sandbox.id, &suffix[..8]);
        tracing::debug!(task = %sandbox.task, job = %id, address = %self.address, "submitting job");
        self.submit(&id, command, &sandbox.working_dir).await?;
        let collected = self.collect(&id, timeout).await;
        self.purge(&id).await;
        collected
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
