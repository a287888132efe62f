//! Backend drivers and the closed set the engine dispatches over.
//!
//! Every driver is generic over the command channel it talks through;
//! [`Backend`] fixes that channel to [`Channel`] and picks the variant from a
//! task's backend configuration.

pub mod apptainer;
pub mod batch;
pub mod docker;
pub mod kubernetes;
pub mod nomad;
pub mod slurm;
pub mod workdir;

use std::time::Duration;

use dagon_core::channel::ChannelOutput;
use dagon_core::sandbox::{SandboxDriver, SandboxError, SandboxRequest};
use dagon_types::backend::{BackendConfig, BackendKind, Placement};
use dagon_types::config::EngineConfig;
use dagon_types::sandbox::SandboxInfo;

use crate::channel::Channel;

pub use apptainer::ApptainerDriver;
pub use batch::BatchDriver;
pub use docker::DockerDriver;
pub use kubernetes::KubernetesDriver;
pub use nomad::{NomadDriver, NomadJob};
pub use slurm::SlurmDriver;

/// Engine knobs a driver needs, resolved for one placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSettings {
    /// Directory under which sandboxes are created on the channel's host.
    pub scratch_root: String,
    /// Bound on one backend tooling command.
    pub command_timeout: Duration,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
}

impl DriverSettings {
    pub fn for_placement(config: &EngineConfig, placement: &Placement) -> Self {
        let scratch_root = match placement {
            Placement::Local => config.scratch_root.to_string_lossy().into_owned(),
            Placement::Remote(_) => config.remote_scratch_root.clone(),
        };
        Self {
            scratch_root,
            command_timeout: config.command_timeout(),
            ready_timeout: config.ready_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(scratch_root: &str) -> Self {
        Self {
            scratch_root: scratch_root.to_string(),
            command_timeout: Duration::from_secs(30),
            ready_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(1),
        }
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Backend {
    Batch(BatchDriver<Channel>),
    Docker(DockerDriver<Channel>),
    Apptainer(ApptainerDriver<Channel>),
    Kubernetes(KubernetesDriver<Channel>),
    Nomad(NomadDriver<Channel>),
    Slurm(SlurmDriver<Channel>),
}

/// Nomad agent address: the configured one, else the agent on the task's host.
fn nomad_address(address: &Option<String>, placement: &Placement) -> String {
    match (address, placement) {
        (Some(address), _) => address.clone(),
        (None, Placement::Local) => format!("http://127.0.0.1:{}", nomad::NOMAD_PORT),
        (None, Placement::Remote(remote)) => format!("http://{}:{}", remote.host, nomad::NOMAD_PORT),
    }
}

/// Build the driver for one task's backend and placement.
pub fn build_driver(backend: &BackendConfig, placement: &Placement, config: &EngineConfig) -> Backend {
    let settings = DriverSettings::for_placement(config, placement);
    let channel = Channel::for_placement(placement, settings.command_timeout);
    match backend {
        BackendConfig::Batch => Backend::Batch(BatchDriver::new(channel, settings.scratch_root)),
        BackendConfig::Docker { image, volumes } => {
            Backend::Docker(DockerDriver::new(channel, settings, image.clone(), volumes.clone()))
        }
        BackendConfig::Apptainer {
            image,
            bind_paths,
            overlay_size_mb,
        } => Backend::Apptainer(ApptainerDriver::new(
            channel,
            settings,
            image.clone(),
            bind_paths.clone(),
            *overlay_size_mb,
            placement.is_remote(),
        )),
        BackendConfig::Kubernetes { image, namespace } => Backend::Kubernetes(KubernetesDriver::new(
            channel,
            settings,
            image.clone(),
            namespace.clone(),
        )),
        BackendConfig::Nomad {
            image,
            address,
            datacenter,
            region,
            cpu,
            memory_mb,
            network_mode,
        } => {
            let job = NomadJob {
                image: image.clone(),
                datacenter: datacenter.clone(),
                region: region.clone(),
                cpu: *cpu,
                memory_mb: *memory_mb,
                network_mode: network_mode.clone(),
            };
            Backend::Nomad(NomadDriver::new(channel, settings, job, nomad_address(address, placement)))
        }
        BackendConfig::Slurm {
            partition,
            ntasks,
            memory_mb,
        } => Backend::Slurm(SlurmDriver::new(
            channel,
            settings,
            partition.clone(),
            *ntasks,
            *memory_mb,
        )),
    }
}

macro_rules! dispatch {
    ($self:ident, $d:ident => $call:expr) => {
        match $self {
            Backend::Batch($d) => $call,
            Backend::Docker($d) => $call,
            Backend::Apptainer($d) => $call,
            Backend::Kubernetes($d) => $call,
            Backend::Nomad($d) => $call,
            Backend::Slurm($d) => $call,
        }
    };
}

impl SandboxDriver for Backend {
    type Channel = Channel;

    fn channel(&self) -> &Channel {
        dispatch!(self, d => d.channel())
    }

    fn kind(&self) -> BackendKind {
        dispatch!(self, d => d.kind())
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        dispatch!(self, d => d.create(request).await)
    }

    async fn run(
        &self,
        sandbox: &SandboxInfo,
        command: &str,
        timeout: Duration,
    ) -> Result<ChannelOutput, SandboxError> {
        dispatch!(self, d => d.run(sandbox, command, timeout).await)
    }

    async fn read_file(&self, sandbox: &SandboxInfo, path: &str) -> Result<Vec<u8>, SandboxError> {
        dispatch!(self, d => d.read_file(sandbox, path).await)
    }

    async fn write_file(
        &self,
        sandbox: &SandboxInfo,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), SandboxError> {
        dispatch!(self, d => d.write_file(sandbox, path, bytes).await)
    }

    async fn destroy(&self, sandbox: &SandboxInfo) -> Result<(), SandboxError> {
        dispatch!(self, d => d.destroy(sandbox).await)
    }

    fn noise_markers(&self) -> &'static [&'static str] {
        dispatch!(self, d => d.noise_markers())
    }

    async fn export(&self, sandbox: &SandboxInfo, path: &str, slot: &str) -> Result<String, SandboxError> {
        dispatch!(self, d => d.export(sandbox, path, slot).await)
    }

    async fn import(&self, sandbox: &SandboxInfo, slot_path: &str, path: &str) -> Result<(), SandboxError> {
        dispatch!(self, d => d.import(sandbox, slot_path, path).await)
    }

    async fn attach(&self, task: &str, working_dir: &str) -> Result<SandboxInfo, SandboxError> {
        dispatch!(self, d => d.attach(task, working_dir).await)
    }

    async fn persist(&self, sandbox: &SandboxInfo, suffix: &str) -> Result<SandboxInfo, SandboxError> {
        dispatch!(self, d => d.persist(sandbox, suffix).await)
    }
}

#[cfg(test)]
mod tests {
    use dagon_core::channel::CommandChannel;
    use dagon_types::backend::RemoteConfig;

    use super::*;

    #[test]
    fn every_configuration_builds_its_driver() {
        let config = EngineConfig::default();
        let backends = [
            BackendConfig::Batch,
            BackendConfig::Docker {
                image: "ubuntu:22.04".to_string(),
                volumes: vec![],
            },
            serde_json::from_str(r#"{"type": "apptainer"}"#).unwrap(),
            serde_json::from_str(r#"{"type": "kubernetes"}"#).unwrap(),
            serde_json::from_str(r#"{"type": "nomad"}"#).unwrap(),
            serde_json::from_str(r#"{"type": "slurm"}"#).unwrap(),
        ];
        for backend in backends {
            let driver = build_driver(&backend, &Placement::Local, &config);
            assert_eq!(driver.kind(), backend.kind());
            assert_eq!(driver.channel().location(), "local");
        }
    }

    #[test]
    fn remote_placement_uses_ssh_and_remote_scratch() {
        let mut config = EngineConfig::default();
        config.remote_scratch_root = "/scratch/hpc".to_string();
        let placement = Placement::Remote(RemoteConfig::new("10.0.0.5", "hpc"));

        let driver = build_driver(&BackendConfig::Batch, &placement, &config);
        assert!(driver.channel().is_remote());
        assert_eq!(driver.channel().location(), "hpc@10.0.0.5:22");

        let settings = DriverSettings::for_placement(&config, &placement);
        assert_eq!(settings.scratch_root, "/scratch/hpc");
        assert_eq!(settings.command_timeout, config.command_timeout());
    }

    #[test]
    fn nomad_address_follows_placement() {
        let nomad: BackendConfig = serde_json::from_str(r#"{"type": "nomad"}"#).unwrap();
        let config = EngineConfig::default();

        let Backend::Nomad(local) = build_driver(&nomad, &Placement::Local, &config) else {
            panic!("expected nomad driver");
        };
        assert_eq!(local.address(), "http://127.0.0.1:4646");

        let remote = Placement::Remote(RemoteConfig::new("cluster", "ops"));
        let Backend::Nomad(remote) = build_driver(&nomad, &remote, &config) else {
            panic!("expected nomad driver");
        };
        assert_eq!(remote.address(), "http://cluster:4646");

        let pinned: BackendConfig =
            serde_json::from_str(r#"{"type": "nomad", "address": "http://nomad.internal:4646"}"#)
                .unwrap();
        let Backend::Nomad(pinned) = build_driver(&pinned, &Placement::Local, &config) else {
            panic!("expected nomad driver");
        };
        assert_eq!(pinned.address(), "http://nomad.internal:4646");
    }

    #[test]
    fn noise_markers_follow_the_backend() {
        let config = EngineConfig::default();
        let backend: BackendConfig = serde_json::from_str(r#"{"type": "slurm"}"#).unwrap();
        assert_eq!(
            build_driver(&backend, &Placement::Local, &config).noise_markers(),
            slurm::NOISE_MARKERS
        );
        assert!(build_driver(&BackendConfig::Batch, &Placement::Local, &config)
            .noise_markers()
            .is_empty());
    }
}
