//! Backend and placement configuration.
//!
//! A task is described by two orthogonal choices: *what* executes the command
//! (`BackendConfig`) and *where* the backend tooling is reached (`Placement`).
//! The engine dispatches over the product of both through a single driver
//! interface, so each variant only carries the fields it needs.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Backend configuration
// ---------------------------------------------------------------------------

/// Backend-specific configuration for a task.
///
/// Internally tagged by `type` to match the workflow file structure:
/// ```yaml
/// backend:
///   type: apptainer
///   image: docker://ubuntu:20.04
///   overlay_size_mb: 512
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Plain shell execution in a host directory.
    #[default]
    Batch,
    /// A long-lived container managed through the container runtime CLI.
    Docker {
        image: String,
        /// Extra `host:container` volume bindings.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<String>,
    },
    /// An Apptainer image with a writable overlay.
    Apptainer {
        #[serde(default = "default_apptainer_image")]
        image: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        bind_paths: Vec<String>,
        #[serde(default = "default_overlay_size_mb")]
        overlay_size_mb: u32,
    },
    /// A pod kept alive with `sleep infinity` and driven through `kubectl`.
    Kubernetes {
        #[serde(default = "default_kubernetes_image")]
        image: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    /// One cluster batch job per command, submitted through the Nomad REST API.
    Nomad {
        #[serde(default = "default_nomad_image")]
        image: String,
        /// API address; defaults to the local agent or the remote host.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default = "default_datacenter")]
        datacenter: String,
        #[serde(default = "default_region")]
        region: String,
        /// CPU share in MHz.
        #[serde(default = "default_nomad_cpu")]
        cpu: u32,
        #[serde(default = "default_nomad_memory_mb")]
        memory_mb: u32,
        #[serde(default = "default_network_mode")]
        network_mode: String,
    },
    /// Commands dispatched to an HPC resource manager through `srun`.
    Slurm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
        #[serde(default = "default_ntasks")]
        ntasks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_mb: Option<u32>,
    },
}

fn default_apptainer_image() -> String {
    "docker://ubuntu:20.04".to_string()
}

fn default_overlay_size_mb() -> u32 {
    1024
}

fn default_kubernetes_image() -> String {
    "ubuntu:20.04".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_nomad_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

fn default_region() -> String {
    "global".to_string()
}

fn default_nomad_cpu() -> u32 {
    500
}

fn default_nomad_memory_mb() -> u32 {
    256
}

fn default_network_mode() -> String {
    "host".to_string()
}

fn default_ntasks() -> u32 {
    1
}

impl BackendConfig {
    /// The discriminant of this configuration.
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Batch => BackendKind::Batch,
            Self::Docker { .. } => BackendKind::Docker,
            Self::Apptainer { .. } => BackendKind::Apptainer,
            Self::Kubernetes { .. } => BackendKind::Kubernetes,
            Self::Nomad { .. } => BackendKind::Nomad,
            Self::Slurm { .. } => BackendKind::Slurm,
        }
    }
}

/// Field-less discriminant of [`BackendConfig`], used for logging and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Batch,
    Docker,
    Apptainer,
    Kubernetes,
    Nomad,
    Slurm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Batch => "batch",
            Self::Docker => "docker",
            Self::Apptainer => "apptainer",
            Self::Kubernetes => "kubernetes",
            Self::Nomad => "nomad",
            Self::Slurm => "slurm",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Connection parameters for a host reached over secure shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub host: String,
    pub user: String,
    /// Private key passed with `-i`; the agent/default identity is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

impl RemoteConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: None,
            port: default_ssh_port(),
        }
    }

    /// `user@host:port`, used as the co-location key for staging relays.
    pub fn location(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Where a task's backend tooling runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Placement {
    #[default]
    Local,
    Remote(RemoteConfig),
}

impl Placement {
    /// Remote when connection parameters were supplied, local otherwise.
    pub fn from_remote(remote: Option<RemoteConfig>) -> Self {
        match remote {
            Some(cfg) => Self::Remote(cfg),
            None => Self::Local,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_defaults_fill_missing_fields() {
        let yaml = "type: apptainer\n";
        let cfg: BackendConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(
            cfg,
            BackendConfig::Apptainer {
                image: "docker://ubuntu:20.04".to_string(),
                bind_paths: vec![],
                overlay_size_mb: 1024,
            }
        );
        assert_eq!(cfg.kind(), BackendKind::Apptainer);
    }

    #[test]
    fn batch_is_the_default_backend() {
        assert_eq!(BackendConfig::default().kind(), BackendKind::Batch);
        assert_eq!(BackendKind::Kubernetes.to_string(), "kubernetes");
    }

    #[test]
    fn placement_follows_presence_of_remote_config() {
        assert_eq!(Placement::from_remote(None), Placement::Local);

        let remote = RemoteConfig::new("10.0.0.5", "hpc");
        let placement = Placement::from_remote(Some(remote.clone()));
        assert!(placement.is_remote());
        assert_eq!(remote.location(), "hpc@10.0.0.5:22");
    }

    #[test]
    fn remote_config_port_defaults_to_22() {
        let cfg: RemoteConfig =
            serde_yaml_ng::from_str("host: cluster\nuser: alice\nkey_path: /keys/id\n").unwrap();
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.key_path, Some(PathBuf::from("/keys/id")));
    }
}
