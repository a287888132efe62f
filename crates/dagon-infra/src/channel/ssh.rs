//! Channel to a remote host through the system `ssh` client.
//!
//! Every operation becomes one `ssh` invocation whose remote command is built
//! from an argument vector with the shared escaping utility. File contents
//! travel through stdin (writes) or base64 on stdout (reads), so arbitrary
//! bytes survive the round trip.

use std::time::Duration;

use base64::Engine;
use dagon_core::channel::{parent_dir, ChannelError, ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::escape::{join, quote};
use dagon_types::backend::RemoteConfig;

use super::local::LocalChannel;

/// Exit status `ssh` itself uses for connection and authentication failures.
const SSH_FAILURE: i32 = 255;

/// Bound applied to remote commands that carry none of their own.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct SshChannel {
    remote: RemoteConfig,
    local: LocalChannel,
    program: String,
    command_timeout: Duration,
}

impl SshChannel {
    pub fn new(remote: RemoteConfig) -> Self {
        Self {
            remote,
            local: LocalChannel::new(),
            program: "ssh".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Bound every remote command without an explicit timeout, file
    /// operations included.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Client binary to invoke instead of `ssh` from `PATH`.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn remote(&self) -> &RemoteConfig {
        &self.remote
    }

    /// Full `ssh` argument vector running `remote_command` on the host.
    pub fn ssh_argv(&self, remote_command: &str) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "-p".to_string(),
            self.remote.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(key) = &self.remote.key_path {
            argv.push("-i".to_string());
            argv.push(key.to_string_lossy().into_owned());
        }
        argv.push(format!("{}@{}", self.remote.user, self.remote.host));
        argv.push(remote_command.to_string());
        argv
    }

    /// The shell line the remote host runs for `request`.
    pub fn remote_command(request: &CommandRequest) -> String {
        let command = request.to_shell();
        match &request.cwd {
            Some(dir) => format!("cd {} && {command}", quote(dir)),
            None => command,
        }
    }

    async fn run_remote(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        let mut wrapped = CommandRequest::new(self.ssh_argv(&Self::remote_command(&request)));
        wrapped.stdin = request.stdin;
        wrapped.timeout = Some(request.timeout.unwrap_or(self.command_timeout));

        let output = self.local.execute(wrapped).await?;
        if output.code == SSH_FAILURE {
            return Err(ChannelError::Transport {
                location: self.location(),
                message: output.message(),
            });
        }
        Ok(output)
    }

    /// Run a shell line remotely and require success.
    async fn run_checked(&self, script: String, path: &str) -> Result<ChannelOutput, ChannelError> {
        let request = CommandRequest::shell(script);
        let output = self.run_remote(request.clone()).await?;
        if !output.success() {
            tracing::debug!(location = %self.location(), path, code = output.code, "remote file operation failed");
            return Err(ChannelError::failed(&request, &output));
        }
        Ok(output)
    }
}

fn mkdir_parent(path: &str) -> String {
    match parent_dir(path) {
        Some(parent) => format!("mkdir -p {} && ", quote(parent)),
        None => String::new(),
    }
}

impl CommandChannel for SshChannel {
    fn location(&self) -> String {
        self.remote.location()
    }

    async fn execute(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        tracing::trace!(location = %self.location(), command = %request.to_shell(), "remote command");
        self.run_remote(request).await
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        let output = self
            .run_checked(join(&["base64", "-w0", path]), path)
            .await?;
        let encoded: String = output.stdout.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ChannelError::Transport {
                location: self.location(),
                message: format!("undecodable contents of {path}: {e}"),
            })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        let script = format!("{}cat > {}", mkdir_parent(path), quote(path));
        let request = CommandRequest::shell(script).stdin(bytes.to_vec());
        let output = self.run_remote(request.clone()).await?;
        if !output.success() {
            return Err(ChannelError::failed(&request, &output));
        }
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), ChannelError> {
        self.run_checked(join(&["mkdir", "-p", path]), path).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ChannelError> {
        self.run_checked(join(&["rm", path]), path).await?;
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ChannelError> {
        self.run_checked(join(&["rm", "-rf", path]), path).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        let script = format!("{}{}", mkdir_parent(to), join(&["mv", from, to]));
        self.run_checked(script, from).await?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, ChannelError> {
        let output = self
            .run_remote(CommandRequest::shell(join(&["test", "-e", path])))
            .await?;
        Ok(output.success())
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        let script = format!("{}{}", mkdir_parent(to), join(&["cp", from, to]));
        self.run_checked(script, from).await?;
        Ok(())
    }
}
