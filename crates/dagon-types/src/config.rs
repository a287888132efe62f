//! Engine configuration.
//!
//! `EngineConfig` represents `dagon.toml`. Every field has a default so an
//! empty or missing file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for any single backend command.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Host directory under which local sandboxes are created.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Directory under which sandboxes are created on remote hosts.
    #[serde(default = "default_remote_scratch_root")]
    pub remote_scratch_root: String,

    /// Leave sandboxes in place on teardown (debugging).
    #[serde(default)]
    pub keep_sandboxes: bool,

    /// Maximum number of tasks running at once (unbounded when unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Bound on waiting for a pod or job to become ready.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Polling period for readiness and job status checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("dagon")
}

fn default_remote_scratch_root() -> String {
    "/tmp/dagon".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            scratch_root: default_scratch_root(),
            remote_scratch_root: default_remote_scratch_root(),
            keep_sandboxes: false,
            max_concurrency: None,
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(300));
        assert!(!config.keep_sandboxes);
        assert!(config.max_concurrency.is_none());
        assert_eq!(config.remote_scratch_root, "/tmp/dagon");
    }

    #[test]
    fn engine_config_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
command_timeout_secs = 30
max_concurrency = 4
"#,
        )
        .unwrap();
        assert_eq!(config.command_timeout_secs, 30);
        assert_eq!(config.max_concurrency, Some(4));
        assert_eq!(config.ready_timeout_secs, 120);
        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
    }
}
