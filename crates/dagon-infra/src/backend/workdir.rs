//! Host working directories shared by every driver.
//!
//! Each sandbox owns `<scratch>/<sandbox-id>` on the channel's host, with the
//! staging and inputs directories nested under `.dagon/`.

use dagon_core::channel::{join_path, ChannelOutput, CommandChannel, CommandRequest};
use dagon_core::sandbox::{SandboxError, SandboxRequest, INPUTS_DIR, STAGING_DIR};
use dagon_types::sandbox::SandboxInfo;

/// Host directories of a freshly provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    pub root: String,
    pub staging: String,
}

/// Create the working, staging and inputs directories for `request`.
pub async fn create<C: CommandChannel>(
    channel: &C,
    request: &SandboxRequest,
    scratch_root: &str,
) -> Result<Workdir, SandboxError> {
    let root = request.working_dir_under(scratch_root);
    let staging = join_path(&root, STAGING_DIR);
    let inputs = join_path(&root, INPUTS_DIR);
    for dir in [&staging, &inputs] {
        channel
            .create_dir(dir)
            .await
            .map_err(|e| SandboxError::Provisioning(format!("cannot create {dir}: {e}")))?;
    }
    Ok(Workdir { root, staging })
}

pub async fn read<C: CommandChannel>(
    channel: &C,
    sandbox: &SandboxInfo,
    path: &str,
) -> Result<Vec<u8>, SandboxError> {
    let full = join_path(&sandbox.working_dir, path);
    channel
        .read_file(&full)
        .await
        .map_err(|e| SandboxError::staging(&full, e))
}

pub async fn write<C: CommandChannel>(
    channel: &C,
    sandbox: &SandboxInfo,
    path: &str,
    bytes: &[u8],
) -> Result<(), SandboxError> {
    let full = join_path(&sandbox.working_dir, path);
    channel
        .write_file(&full, bytes)
        .await
        .map_err(|e| SandboxError::staging(&full, e))
}

pub async fn remove<C: CommandChannel>(channel: &C, dir: &str) -> Result<(), SandboxError> {
    channel
        .remove_dir(dir)
        .await
        .map_err(|e| SandboxError::Cleanup(format!("cannot remove {dir}: {e}")))
}

/// Run a backend tooling command that must succeed; a non-zero exit becomes
/// `on_failure(message)`.
pub async fn run_checked<C: CommandChannel>(
    channel: &C,
    request: CommandRequest,
    on_failure: fn(String) -> SandboxError,
) -> Result<ChannelOutput, SandboxError> {
    let shown = request.to_shell();
    let output = channel.execute(request).await?;
    if !output.success() {
        return Err(on_failure(format!(
            "'{shown}' exited with code {}: {}",
            output.code,
            output.message()
        )));
    }
    Ok(output)
}
