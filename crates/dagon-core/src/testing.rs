//! In-memory channel and driver used by the core's tests.
//!
//! `MockDriver::run` understands a tiny `;`-separated command language so the
//! engine can be exercised end to end without processes:
//!
//! - `write <path> <text>`: write `<text>` to `<path>` in the sandbox
//! - `cat <path>`: print a file (exit 1 when missing)
//! - `echo <text>`: print text verbatim
//! - `stderr <text>`: print text to stderr
//! - `exit <code>`: stop with `<code>`
//! - `hang`: exceed the time bound
//! - `bash .dagon/checkpoint.sh <inputs>`: the checkpoint verification step

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dagon_types::backend::BackendKind;
use dagon_types::sandbox::{SandboxHandle, SandboxInfo};

use crate::channel::{join_path, ChannelError, ChannelOutput, CommandChannel, CommandRequest};
use crate::sandbox::{SandboxDriver, SandboxError, SandboxRequest, INPUTS_DIR, STAGING_DIR};
use crate::task::CHECKPOINT_SCRIPT;

// ---------------------------------------------------------------------------
// MockChannel
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

/// A host with an in-memory filesystem. Clones share the filesystem.
#[derive(Debug, Clone)]
pub struct MockChannel {
    location: String,
    fs: Arc<Mutex<MockFs>>,
    pub commands: Arc<Mutex<Vec<CommandRequest>>>,
    /// Every path passed to `write_file`, in order.
    pub writes: Arc<Mutex<Vec<String>>>,
}

impl MockChannel {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            fs: Arc::new(Mutex::new(MockFs::default())),
            commands: Arc::new(Mutex::new(Vec::new())),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.lock().unwrap().files.get(path).cloned()
    }

    pub fn put(&self, path: &str, bytes: &[u8]) {
        self.fs.lock().unwrap().files.insert(path.to_string(), bytes.to_vec());
    }

    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.fs
            .lock()
            .unwrap()
            .files
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn io_error(path: &str) -> ChannelError {
        ChannelError::Io {
            path: path.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        }
    }
}

impl CommandChannel for MockChannel {
    fn location(&self) -> String {
        self.location.clone()
    }

    async fn execute(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        self.commands.lock().unwrap().push(request);
        Ok(ChannelOutput::default())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        self.file(path).ok_or_else(|| Self::io_error(path))
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        self.writes.lock().unwrap().push(path.to_string());
        self.put(path, bytes);
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<(), ChannelError> {
        self.fs.lock().unwrap().dirs.insert(path.to_string());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ChannelError> {
        match self.fs.lock().unwrap().files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Self::io_error(path)),
        }
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ChannelError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let mut fs = self.fs.lock().unwrap();
        fs.files.retain(|p, _| !p.starts_with(&prefix));
        fs.dirs.retain(|d| d != path && !d.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        let prefix = format!("{}/", from.trim_end_matches('/'));
        let mut fs = self.fs.lock().unwrap();
        let moved: Vec<(String, Vec<u8>)> = fs
            .files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .map(|(p, b)| (format!("{to}/{}", &p[prefix.len()..]), b.clone()))
            .collect();
        if moved.is_empty() && !fs.dirs.contains(from) {
            return Err(Self::io_error(from));
        }
        fs.files.retain(|p, _| !p.starts_with(&prefix));
        fs.files.extend(moved);
        fs.dirs.remove(from);
        fs.dirs.insert(to.to_string());
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, ChannelError> {
        let fs = self.fs.lock().unwrap();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(fs.files.contains_key(path)
            || fs.dirs.contains(path)
            || fs.files.keys().any(|p| p.starts_with(&prefix)))
    }
}

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

/// Counters shared between clones of one driver.
#[derive(Debug, Default)]
pub struct MockStats {
    pub creates: AtomicUsize,
    pub runs: AtomicUsize,
    pub destroys: AtomicUsize,
    /// Number of upcoming `create` calls that fail.
    pub failing_creates: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MockDriver {
    channel: MockChannel,
    pub stats: Arc<MockStats>,
    create_delay: Duration,
    noise: &'static [&'static str],
}

impl MockDriver {
    pub fn new(channel: MockChannel) -> Self {
        Self {
            channel,
            stats: Arc::new(MockStats::default()),
            create_delay: Duration::ZERO,
            noise: &[],
        }
    }

    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub fn with_noise(mut self, markers: &'static [&'static str]) -> Self {
        self.noise = markers;
        self
    }

    pub fn creates(&self) -> usize {
        self.stats.creates.load(Ordering::SeqCst)
    }

    pub fn runs(&self) -> usize {
        self.stats.runs.load(Ordering::SeqCst)
    }

    fn interpret(&self, sandbox: &SandboxInfo, command: &str, timeout: Duration) -> Result<ChannelOutput, SandboxError> {
        let mut out = ChannelOutput::default();
        for step in command.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (verb, rest) = step.split_once(' ').unwrap_or((step, ""));
            match verb {
                "write" => {
                    let (path, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    self.channel.put(&join_path(&sandbox.working_dir, path), text.as_bytes());
                }
                "cat" => match self.channel.file(&join_path(&sandbox.working_dir, rest)) {
                    Some(bytes) => out.stdout.push_str(&String::from_utf8_lossy(&bytes)),
                    None => {
                        out.stderr.push_str(&format!("cat: {rest}: No such file or directory\n"));
                        out.code = 1;
                        return Ok(out);
                    }
                },
                "echo" => {
                    out.stdout.push_str(rest);
                    out.stdout.push('\n');
                }
                "stderr" => {
                    out.stderr.push_str(rest);
                    out.stderr.push('\n');
                }
                "exit" => {
                    out.code = rest.parse().unwrap_or(1);
                    return Ok(out);
                }
                "hang" => return Err(SandboxError::Timeout(timeout)),
                "bash" => {
                    let mut args = rest.split_whitespace();
                    if args.next() != Some(CHECKPOINT_SCRIPT) {
                        out.code = 127;
                        return Ok(out);
                    }
                    for input in args {
                        if self.channel.file(&join_path(&sandbox.working_dir, input)).is_none() {
                            out.stderr.push_str(&format!("checkpoint input missing: {input}\n"));
                            out.code = 1;
                            return Ok(out);
                        }
                    }
                    let inputs = join_path(&sandbox.working_dir, INPUTS_DIR);
                    for path in self.channel.paths_under(&inputs) {
                        if let Some(bytes) = self.channel.file(&path) {
                            let relocated = join_path(&sandbox.working_dir, &path[inputs.len() + 1..]);
                            self.channel.put(&relocated, &bytes);
                            self.channel.fs.lock().unwrap().files.remove(&path);
                        }
                    }
                }
                other => {
                    out.stderr.push_str(&format!("{other}: command not found\n"));
                    out.code = 127;
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

impl SandboxDriver for MockDriver {
    type Channel = MockChannel;

    fn channel(&self) -> &MockChannel {
        &self.channel
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Batch
    }

    async fn create(&self, request: &SandboxRequest) -> Result<SandboxInfo, SandboxError> {
        self.stats.creates.fetch_add(1, Ordering::SeqCst);
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        let pending_failures = self.stats.failing_creates.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.stats.failing_creates.store(pending_failures - 1, Ordering::SeqCst);
            return Err(SandboxError::Provisioning("injected failure".to_string()));
        }

        let working_dir = request.working_dir_under("/mock");
        let staging_dir = join_path(&working_dir, STAGING_DIR);
        self.channel.create_dir(&working_dir).await?;
        self.channel.create_dir(&staging_dir).await?;
        Ok(SandboxInfo {
            id: request.id.clone(),
            task: request.task.clone(),
            working_dir,
            staging_dir,
            location: self.channel.location(),
            handle: SandboxHandle::Directory,
            created_at: Utc::now(),
        })
    }

    async fn run(&self, sandbox: &SandboxInfo, command: &str, timeout: Duration) -> Result<ChannelOutput, SandboxError> {
        self.stats.runs.fetch_add(1, Ordering::SeqCst);
        self.interpret(sandbox, command, timeout)
    }

    async fn read_file(&self, sandbox: &SandboxInfo, path: &str) -> Result<Vec<u8>, SandboxError> {
        let full = join_path(&sandbox.working_dir, path);
        self.channel
            .read_file(&full)
            .await
            .map_err(|e| SandboxError::staging(&full, e))
    }

    async fn write_file(&self, sandbox: &SandboxInfo, path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        self.channel
            .write_file(&join_path(&sandbox.working_dir, path), bytes)
            .await?;
        Ok(())
    }

    async fn destroy(&self, sandbox: &SandboxInfo) -> Result<(), SandboxError> {
        self.stats.destroys.fetch_add(1, Ordering::SeqCst);
        self.channel.remove_dir(&sandbox.working_dir).await?;
        Ok(())
    }

    fn noise_markers(&self) -> &'static [&'static str] {
        self.noise
    }
}
