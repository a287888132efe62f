//! Command channel port.
//!
//! A `CommandChannel` is the transport every backend driver talks through: the
//! local host (child processes + local filesystem) or a remote host reached
//! over secure shell. Drivers never touch processes or files directly, which is
//! what makes local and remote placement behave identically.

use std::future::Future;
use std::time::Duration;

use crate::escape;

/// Co-location key of the local host.
pub const LOCAL_LOCATION: &str = "local";

// ---------------------------------------------------------------------------
// Request / output
// ---------------------------------------------------------------------------

/// A structured command: argument vector plus execution options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// `bash -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["bash".to_string(), "-c".to_string(), script.into()])
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Same request with `prefix` prepended to the argument vector.
    pub fn prefixed<I, S>(mut self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv: Vec<String> = prefix.into_iter().map(Into::into).collect();
        argv.append(&mut self.argv);
        self.argv = argv;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// The argument vector as one shell-safe string (also used for logging).
    pub fn to_shell(&self) -> String {
        escape::join(&self.argv)
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ChannelOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Best human-readable failure message: stderr, or stdout when stderr is empty.
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by a command channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("'{command}' failed with code {code}: {message}")]
    Failed {
        command: String,
        code: i32,
        message: String,
    },

    #[error("transport error on {location}: {message}")]
    Transport { location: String, message: String },
}

impl ChannelError {
    /// Error for a request that completed with a non-zero code.
    pub fn failed(request: &CommandRequest, output: &ChannelOutput) -> Self {
        Self::Failed {
            command: request.to_shell(),
            code: output.code,
            message: output.message(),
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Transport for commands and files on one host.
///
/// Paths are POSIX strings interpreted on the channel's host, which is why
/// they are not `Path`s.
pub trait CommandChannel: Send + Sync + 'static {
    /// Co-location key: two channels with the same location share a filesystem.
    fn location(&self) -> String;

    /// Run a command to completion, honouring `request.timeout`.
    fn execute(
        &self,
        request: CommandRequest,
    ) -> impl Future<Output = Result<ChannelOutput, ChannelError>> + Send;

    fn read_file(&self, path: &str)
    -> impl Future<Output = Result<Vec<u8>, ChannelError>> + Send;

    /// Write `bytes` to `path`, creating parent directories.
    fn write_file(
        &self,
        path: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn create_dir(&self, path: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn remove_file(&self, path: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn remove_dir(&self, path: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn rename(&self, from: &str, to: &str)
    -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = Result<bool, ChannelError>> + Send;

    /// Host-side copy; creates the destination's parent directories.
    fn copy_file(
        &self,
        from: &str,
        to: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send {
        async move {
            let bytes = self.read_file(from).await?;
            self.write_file(to, &bytes).await
        }
    }
}

/// Join a sandbox-relative `path` onto `root` unless it is already absolute.
pub fn join_path(root: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches('/'), path.trim_start_matches("./"))
    }
}

/// Parent directory of a POSIX path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}
