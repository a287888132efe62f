//! Channel to the local host: child processes and the local filesystem.

use std::path::Path;
use std::process::Stdio;

use dagon_core::channel::{
    ChannelError, ChannelOutput, CommandChannel, CommandRequest, LOCAL_LOCATION,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Runs commands as child processes of the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChannel;

impl LocalChannel {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(path: &str) -> impl FnOnce(std::io::Error) -> ChannelError + '_ {
    move |source| ChannelError::Io {
        path: path.to_string(),
        source,
    }
}

async fn create_parent(path: &str) -> Result<(), ChannelError> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(path))?;
    }
    Ok(())
}

impl CommandChannel for LocalChannel {
    fn location(&self) -> String {
        LOCAL_LOCATION.to_string()
    }

    async fn execute(&self, request: CommandRequest) -> Result<ChannelOutput, ChannelError> {
        let program = request.program().to_string();
        let Some((head, args)) = request.argv.split_first() else {
            return Err(ChannelError::Spawn {
                program,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let mut command = Command::new(head);
        command
            .args(args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }

        tracing::trace!(command = %request.to_shell(), cwd = ?request.cwd, "spawning");
        let mut child = command.spawn().map_err(|source| ChannelError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe.
        if let (Some(bytes), Some(mut stdin)) = (request.stdin, child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::debug!(error = %e, "child closed stdin early");
                }
            });
        }

        let wait = child.wait_with_output();
        let output = match request.timeout {
            Some(after) => tokio::time::timeout(after, wait)
                .await
                .map_err(|_| ChannelError::Timeout { after })?,
            None => wait.await,
        }
        .map_err(|source| ChannelError::Io {
            path: program,
            source,
        })?;

        Ok(ChannelOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // Killed by a signal.
            code: output.status.code().unwrap_or(-1),
        })
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ChannelError> {
        tokio::fs::read(path).await.map_err(io_error(path))
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), ChannelError> {
        create_parent(path).await?;
        tokio::fs::write(path, bytes).await.map_err(io_error(path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), ChannelError> {
        tokio::fs::create_dir_all(path).await.map_err(io_error(path))
    }

    async fn remove_file(&self, path: &str) -> Result<(), ChannelError> {
        tokio::fs::remove_file(path).await.map_err(io_error(path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), ChannelError> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(io_error(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        create_parent(to).await?;
        tokio::fs::rename(from, to).await.map_err(io_error(from))
    }

    async fn exists(&self, path: &str) -> Result<bool, ChannelError> {
        tokio::fs::try_exists(path).await.map_err(io_error(path))
    }

    async fn copy_file(&self, from: &str, to: &str) -> Result<(), ChannelError> {
        create_parent(to).await?;
        tokio::fs::copy(from, to)
            .await
            .map(|_| ())
            .map_err(io_error(from))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn execute_captures_output_and_code() {
        let out = LocalChannel
            .execute(CommandRequest::shell("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn execute_honours_cwd_and_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();
        let out = LocalChannel
            .execute(
                CommandRequest::shell("cat > piped.txt && pwd")
                    .cwd(cwd.clone())
                    .stdin(b"line1\nline2".to_vec()),
            )
            .await
            .unwrap();
        assert!(out.success(), "{out:?}");
        assert!(out.stdout.trim().ends_with(dir.path().file_name().unwrap().to_str().unwrap()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("piped.txt")).unwrap(),
            "line1\nline2"
        );
    }

    #[tokio::test]
    async fn execute_times_out() {
        let err = LocalChannel
            .execute(CommandRequest::shell("sleep 5").timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = LocalChannel
            .execute(CommandRequest::new(["dagon-no-such-program-xyz"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Spawn { .. }));
    }

    #[tokio::test]
    async fn file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let file = format!("{root}/a/b/f.bin");
        let bytes = [0u8, 159, 146, 150, b'\n', b'\t'];

        LocalChannel.write_file(&file, &bytes).await.unwrap();
        assert_eq!(LocalChannel.read_file(&file).await.unwrap(), bytes);
        assert!(LocalChannel.exists(&file).await.unwrap());

        let copy = format!("{root}/c/copy.bin");
        LocalChannel.copy_file(&file, &copy).await.unwrap();
        assert_eq!(LocalChannel.read_file(&copy).await.unwrap(), bytes);

        LocalChannel
            .rename(&format!("{root}/a"), &format!("{root}/a-checkpoint"))
            .await
            .unwrap();
        assert!(!LocalChannel.exists(&file).await.unwrap());
        assert!(LocalChannel.exists(&format!("{root}/a-checkpoint/b/f.bin")).await.unwrap());

        LocalChannel.remove_file(&copy).await.unwrap();
        assert!(LocalChannel.remove_file(&copy).await.is_err());
        LocalChannel.remove_dir(&format!("{root}/a-checkpoint")).await.unwrap();
        // Removing a missing directory is not an error.
        LocalChannel.remove_dir(&format!("{root}/a-checkpoint")).await.unwrap();
        assert!(LocalChannel.read_file(&file).await.is_err());
    }
}
