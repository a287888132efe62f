//! Command channels: the local host and remote hosts over secure shell.
//!
//! [`Channel`] is chosen once per task from its placement; every backend
//! driver is generic over the channel it talks through.

pub mod local;
pub mod ssh;

pub use local::LocalChannel;
pub use ssh::SshChannel;

use std::time::Duration;

use dagon_core::channel::{ChannelError, ChannelOutput, CommandChannel, CommandRequest};
use dagon_types::backend::Placement;

#[derive(Debug, Clone)]
pub enum Channel {
    Local(LocalChannel),
    Ssh(SshChannel),
}

impl Channel {
    /// `command_timeout` bounds remote operations that set no timeout themselves.
    pub fn for_placement(placement: &Placement, command_timeout: Duration) -> Self {
        match placement {
            Placement::Local => Self::Local(LocalChannel::new()),
            Placement::Remote(remote) => {
                Self::Ssh(SshChannel::new(remote.clone()).command_timeout(command_timeout))
            }
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Ssh(_))
    }
}

macro_rules! delegate {
    ($self:ident, $ch:ident => $call:expr) => {
        match $self {
            Channel::Local($ch) => $call,
            Channel::Ssh($ch) => $call,
        }
    };
}

impl CommandChannel for Channel {
    fn location(&self) -> String {
        delegate!(self, c => c.location())
    }

    async fn execute(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        delegate!(self, c => c.execute(request).await)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        delegate!(self, c => c.read_file(path).await)
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        delegate!(self, c => c.write_file(path, bytes).await)
    }

    async fn create_dir(&self, path: &str) -> Result<(), ChannelError> {
        delegate!(self, c => c.create_dir(path).await)
    }

    async fn remove_file(&self, path: &str) -> Result<(), ChannelError> {
        delegate!(self, c => c.remove_file(path).await)
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ChannelError> {
        delegate!(self, c => c.remove_dir(path).await)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        delegate!(self, c => c.rename(from, to).await)
    }

    async fn exists(&self, path: &str) -> Result<bool, ChannelError> {
        delegate!(self, c => c.exists(path).await)
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        delegate!(self, c => c.copy_file(from, to).await)
    }
}

#[cfg(test)]
mod tests {
    use dagon_types::backend::RemoteConfig;

    use super::*;

    #[test]
    fn placement_selects_channel() {
        let local = Channel::for_placement(&Placement::Local, Duration::from_secs(5));
        assert!(!local.is_remote());
        assert_eq!(local.location(), "local");

        let remote = Channel::for_placement(
            &Placement::Remote(RemoteConfig::new("hpc01", "alice")),
            Duration::from_secs(5),
        );
        assert!(remote.is_remote());
        assert_eq!(remote.location(), "alice@hpc01:22");
    }

    #[tokio::test]
    async fn local_variant_delegates() {
        let channel = Channel::Local(LocalChannel::new());
        let out = channel
            .execute(CommandRequest::shell("printf dagon"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "dagon");
    }
}
