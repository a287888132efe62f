//! Durable checkpoint file.
//!
//! One JSON object per file mapping `<workflow>.<task>` to the persisted
//! sandbox directory of a completed checkpoint task. Every record is merged
//! into whatever is on disk and the file is replaced atomically, so several
//! workflows can share one file and a crash never leaves it half-written.

use std::path::{Path, PathBuf};

use chrono::Utc;
use dagon_types::checkpoint::{CheckpointFile, CheckpointRecord};
use dagon_types::sandbox::SandboxInfo;

use super::WorkflowError;

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    records: CheckpointFile,
}

impl CheckpointStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let path = path.into();
        let records = read_file(&path).await?;
        tracing::debug!(path = %path.display(), records = records.len(), "checkpoint file loaded");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &CheckpointFile {
        &self.records
    }

    pub fn get(&self, workflow: &str, task: &str) -> Option<&CheckpointRecord> {
        self.records.get(workflow, task)
    }

    /// Record a persisted checkpoint sandbox and flush to disk.
    pub async fn record(
        &mut self,
        workflow: &str,
        task: &str,
        sandbox: &SandboxInfo,
    ) -> Result<(), WorkflowError> {
        let record = CheckpointRecord {
            working_dir: sandbox.working_dir.clone(),
            location: Some(sandbox.location.clone()),
            recorded_at: Some(Utc::now()),
        };

        // Pick up records written by other runs since we opened the file.
        let mut merged = read_file(&self.path).await?;
        merged.merge(std::mem::take(&mut self.records));
        merged.insert(workflow, task, record);
        self.records = merged;

        self.save().await?;
        tracing::info!(
            workflow,
            task,
            working_dir = %sandbox.working_dir,
            path = %self.path.display(),
            "checkpoint recorded"
        );
        Ok(())
    }

    async fn save(&self) -> Result<(), WorkflowError> {
        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| WorkflowError::Checkpoint(format!("serialize checkpoint: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<CheckpointFile, WorkflowError> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(CheckpointFile::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            WorkflowError::Checkpoint(format!("malformed checkpoint file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CheckpointFile::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagon_types::sandbox::SandboxHandle;

    fn sandbox(wd: &str) -> SandboxInfo {
        SandboxInfo {
            id: "c1-abcd".to_string(),
            task: "C1".to_string(),
            working_dir: wd.to_string(),
            staging_dir: format!("{wd}/.dagon/staging"),
            location: "local".to_string(),
            handle: SandboxHandle::Directory,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(dir.path().join("none.json")).await.unwrap();
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn record_writes_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/last_run.json");
        let mut store = CheckpointStore::open(&path).await.unwrap();
        store.record("wf", "C1", &sandbox("/scratch/c1-checkpoint")).await.unwrap();

        let reopened = CheckpointStore::open(&path).await.unwrap();
        let record = reopened.get("wf", "C1").unwrap();
        assert_eq!(record.working_dir, "/scratch/c1-checkpoint");
        assert_eq!(record.location.as_deref(), Some("local"));
        assert!(record.recorded_at.is_some());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["wf.C1"]["working_dir"], "/scratch/c1-checkpoint");
        assert!(!dir.path().join("nested/last_run.json.tmp").exists());
    }

    #[tokio::test]
    async fn record_merges_with_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.json");
        let mut first = CheckpointStore::open(&path).await.unwrap();
        let mut second = CheckpointStore::open(&path).await.unwrap();

        first.record("wf1", "C", &sandbox("/a")).await.unwrap();
        second.record("wf2", "C", &sandbox("/b")).await.unwrap();

        let merged = CheckpointStore::open(&path).await.unwrap();
        assert_eq!(merged.records().len(), 2);
        assert_eq!(merged.get("wf1", "C").unwrap().working_dir, "/a");
        assert_eq!(merged.get("wf2", "C").unwrap().working_dir, "/b");
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = CheckpointStore::open(&path).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Checkpoint(_)));
    }
}
