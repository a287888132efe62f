//! Cross-task reference resolution and byte staging.
//!
//! A command may embed `workflow:///<task>/<path>` tokens. Before the command
//! runs, every token is resolved by:
//!
//! 1. looking the source task up in the caller-supplied task table,
//! 2. ensuring the source's sandbox exists (this can provision a sandbox for a
//!    task that never ran),
//! 3. **export**: copying `<path>` out of the source sandbox into a uniquely
//!    named staging slot on the source host,
//! 4. relaying the slot to the destination's staging directory (host-side copy
//!    when both sandboxes share a host, byte transfer otherwise),
//! 5. **import**: writing the slot into the destination sandbox under
//!    `.dagon/inputs/<workflow>/<task>/<path>`,
//! 6. rewriting the token to that local path and deleting both slots.
//!
//! Each textual occurrence runs the full protocol; identical tokens are not
//! deduplicated.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;

use crate::channel::{join_path, CommandChannel};
use crate::sandbox::{SandboxDriver, INPUTS_DIR};
use crate::task::{Task, TaskError};

/// Scheme prefix of a cross-task reference.
pub const REFERENCE_SCHEME: &str = "workflow:///";

static REFERENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"workflow:///([^/\s]+)/(\S+)").expect("reference pattern is valid"));

static SLOT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One reference token found in a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub task: String,
    pub path: String,
    /// Byte range of the token in the command.
    pub span: std::ops::Range<usize>,
}

impl Reference {
    pub fn token(&self) -> String {
        format!("{REFERENCE_SCHEME}{}/{}", self.task, self.path)
    }
}

/// Every reference occurrence in `command`, in textual order.
pub fn find_references(command: &str) -> Vec<Reference> {
    REFERENCE_RE
        .captures_iter(command)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Reference {
                task: caps[1].to_string(),
                path: caps[2].to_string(),
                span: whole.range(),
            })
        })
        .collect()
}

/// Distinct task names referenced by `command`.
pub fn referenced_tasks(command: &str) -> BTreeSet<String> {
    find_references(command).into_iter().map(|r| r.task).collect()
}

/// Destination-local path for a file imported from `source`.
pub fn import_path(workflow: &str, source: &str, path: &str) -> String {
    format!("{INPUTS_DIR}/{workflow}/{source}/{}", path.trim_start_matches('/'))
}

/// Whether `path` climbs out of the directory it is resolved against.
pub fn escapes_root(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// Collision-resistant staging slot name: source, sanitized path, millisecond
/// timestamp and a process-wide sequence number.
pub fn slot_name(source: &str, path: &str) -> String {
    let sanitized: String = path
        .chars()
        .map(|c| if c == '/' || c.is_whitespace() { '_' } else { c })
        .collect();
    let seq = SLOT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{source}_{sanitized}_{}_{seq}", Utc::now().timestamp_millis())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Explicit task lookup handed to the resolver by the workflow.
pub struct ReferenceContext<'a, D: SandboxDriver> {
    pub workflow: &'a str,
    pub tasks: &'a HashMap<String, Arc<Task<D>>>,
}

impl<D: SandboxDriver> Clone for ReferenceContext<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: SandboxDriver> Copy for ReferenceContext<'_, D> {}

impl<'a, D: SandboxDriver> ReferenceContext<'a, D> {
    pub fn new(workflow: &'a str, tasks: &'a HashMap<String, Arc<Task<D>>>) -> Self {
        Self { workflow, tasks }
    }
}

/// Resolve every reference in `command` on behalf of `dest` and return the
/// rewritten command. All transfers complete before this returns.
pub async fn resolve_references<D: SandboxDriver>(
    dest: &Task<D>,
    command: &str,
    ctx: &ReferenceContext<'_, D>,
) -> Result<String, TaskError> {
    let references = find_references(command);
    if references.is_empty() {
        return Ok(command.to_string());
    }

    let mut rewritten = String::with_capacity(command.len());
    let mut cursor = 0;
    for reference in &references {
        let local = stage_reference(dest, reference, ctx).await?;
        rewritten.push_str(&command[cursor..reference.span.start]);
        rewritten.push_str(&local);
        cursor = reference.span.end;
    }
    rewritten.push_str(&command[cursor..]);
    Ok(rewritten)
}

/// Export, relay and import one reference; returns the destination-local path.
async fn stage_reference<D: SandboxDriver>(
    dest: &Task<D>,
    reference: &Reference,
    ctx: &ReferenceContext<'_, D>,
) -> Result<String, TaskError> {
    let staging_error = |message: String| TaskError::Staging {
        task: dest.name().to_string(),
        reference: reference.token(),
        message,
    };

    if escapes_root(&reference.path) {
        return Err(staging_error(format!(
            "path '{}' may not contain '..' segments",
            reference.path
        )));
    }

    let source = ctx
        .tasks
        .get(&reference.task)
        .ok_or_else(|| TaskError::UnknownTask {
            task: dest.name().to_string(),
            referenced: reference.task.clone(),
        })?;

    let source_sandbox = source.ensure_sandbox().await?;
    let dest_sandbox = dest.ensure_sandbox().await?;

    let slot = slot_name(&reference.task, &reference.path);
    tracing::debug!(
        task = %dest.name(),
        source = %reference.task,
        path = %reference.path,
        slot = %slot,
        "exporting reference"
    );

    let source_slot = source
        .driver()
        .export(&source_sandbox, &reference.path, &slot)
        .await
        .map_err(|e| staging_error(e.to_string()))?;

    let dest_slot = join_path(&dest_sandbox.staging_dir, &slot);
    let source_channel = source.driver().channel();
    let dest_channel = dest.driver().channel();
    if source_slot != dest_slot {
        if source_sandbox.location == dest_sandbox.location {
            dest_channel
                .copy_file(&source_slot, &dest_slot)
                .await
                .map_err(|e| staging_error(e.to_string()))?;
        } else {
            let bytes = source_channel
                .read_file(&source_slot)
                .await
                .map_err(|e| staging_error(e.to_string()))?;
            dest_channel
                .write_file(&dest_slot, &bytes)
                .await
                .map_err(|e| staging_error(e.to_string()))?;
        }
    }

    let local = import_path(ctx.workflow, &reference.task, &reference.path);
    dest.driver()
        .import(&dest_sandbox, &dest_slot, &local)
        .await
        .map_err(|e| staging_error(e.to_string()))?;

    if let Err(e) = source_channel.remove_file(&source_slot).await {
        tracing::debug!(slot = %source_slot, error = %e, "could not delete staging slot");
    }
    if dest_slot != source_slot {
        if let Err(e) = dest_channel.remove_file(&dest_slot).await {
            tracing::debug!(slot = %dest_slot, error = %e, "could not delete staging slot");
        }
    }

    tracing::debug!(task = %dest.name(), source = %reference.task, local = %local, "reference staged");
    Ok(local)
}
