//! A channel that records argv and replays canned responses.
//!
//! Responses are matched by substring against the shell-joined command; the
//! first rule with a match answers. A rule's queued outputs are consumed in
//! order and its last output repeats. Unmatched commands succeed silently.
//! Files live in an in-memory map.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use dagon_core::channel::{ChannelError, ChannelOutput, CommandChannel, CommandRequest};

struct Rule {
    pattern: String,
    outputs: VecDeque<ChannelOutput>,
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    log: Vec<CommandRequest>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Clone)]
pub struct ScriptedChannel {
    location: String,
    state: Arc<Mutex<State>>,
}

pub fn output(stdout: &str, stderr: &str, code: i32) -> ChannelOutput {
    ChannelOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        code,
    }
}

impl ScriptedChannel {
    pub fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn respond(&self, pattern: &str, outputs: Vec<ChannelOutput>) -> &Self {
        self.state.lock().unwrap().rules.push(Rule {
            pattern: pattern.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    /// Every executed request, shell-joined.
    pub fn commands(&self) -> Vec<String> {
        self.requests().iter().map(CommandRequest::to_shell).collect()
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }
}

impl CommandChannel for ScriptedChannel {
    fn location(&self) -> String {
        self.location.clone()
    }

    async fn execute(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        let shown = request.to_shell();
        let mut state = self.state.lock().unwrap();
        state.log.push(request);
        let Some(rule) = state.rules.iter_mut().find(|r| shown.contains(&r.pattern)) else {
            return Ok(ChannelOutput::default());
        };
        let output = if rule.outputs.len() > 1 {
            rule.outputs.pop_front()
        } else {
            rule.outputs.front().cloned()
        };
        Ok(output.unwrap_or_default())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        self.file(path).ok_or_else(|| ChannelError::Io {
            path: path.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn create_dir(&self, _path: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ChannelError> {
        self.state.lock().unwrap().files.remove(path);
        Ok(())
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ChannelError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.state
            .lock()
            .unwrap()
            .files
            .retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, ChannelError> {
        Ok(self.state.lock().unwrap().files.contains_key(path))
    }
}
