//! The transfer plan and its live state.
//!
//! A [`Manifest`] owns an ordered sequence of [`Batch`]es. Batches move
//! along a single forward path
//! (`pending → downloading → buffered → uploading → completed`, with
//! `failed` reachable from the two active states) and all mutable batch
//! state sits behind a per-batch mutex so workers, the dispatcher and the
//! checkpoint saver can share them. The manifest persists as a JSON
//! document; saves snapshot under the locks and write atomically via a
//! temp file and rename.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Downloading,
    Buffered,
    Uploading,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Mutable per-batch state, always accessed under the batch mutex.
#[derive(Debug, Clone)]
pub struct BatchState {
    pub size: u64,
    pub status: BatchStatus,
    pub local_path: Option<std::path::PathBuf>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
}

/// One unit of transfer: a group of source-relative files archived and
/// extracted together.
#[derive(Debug)]
pub struct Batch {
    pub id: usize,
    pub files: Vec<String>,
    pub file_count: usize,
    /// Sum of the source file sizes. Unlike `size`, never corrected to the
    /// archive length, so done-byte accounting stays in source bytes.
    pub source_size: u64,
    state: std::sync::Mutex<BatchState>,
}

impl Batch {
    pub fn new(id: usize, files: Vec<String>, size: u64) -> Self {
        let file_count = files.len();
        Self {
            id,
            files,
            file_count,
            source_size: size,
            state: std::sync::Mutex::new(BatchState {
                size,
                status: BatchStatus::Pending,
                local_path: None,
                error: None,
                started_at: None,
                completed_at: None,
                checksum: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> BatchStatus {
        self.lock().status
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn local_path(&self) -> Option<std::path::PathBuf> {
        self.lock().local_path.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    pub fn set_status(&self, status: BatchStatus) {
        let mut state = self.lock();
        state.status = status;
        if status == BatchStatus::Downloading && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            state.completed_at = Some(Utc::now());
        }
    }

    pub fn set_error(&self, error: &anyhow::Error) {
        let mut state = self.lock();
        state.error = Some(format!("{:#}", error));
        state.status = BatchStatus::Failed;
        state.completed_at = Some(Utc::now());
    }

    /// Record the finished archive: its buffer path and reconciled size.
    /// The transition to `buffered` happens in the same critical section
    /// so no observer ever sees a buffered batch without a path.
    pub fn set_buffered(&self, local_path: std::path::PathBuf, actual_size: u64) {
        let mut state = self.lock();
        state.local_path = Some(local_path);
        state.size = actual_size;
        state.status = BatchStatus::Buffered;
    }

    pub fn snapshot(&self) -> BatchState {
        self.lock().clone()
    }

    /// Reset a non-terminal batch back to pending for a fresh run.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.status = BatchStatus::Pending;
        state.local_path = None;
        state.error = None;
        state.started_at = None;
        state.completed_at = None;
    }
}

/// The plan and live state of one batched tar transfer.
#[derive(Debug)]
pub struct Manifest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    pub destination: String,
    pub chunk_size: u64,
    pub total_files: u64,
    pub total_size: u64,
    status: std::sync::Mutex<(ManifestStatus, Option<DateTime<Utc>>)>,
    pub batches: Vec<std::sync::Arc<Batch>>,
}

pub(crate) fn new_transfer_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("transfer-{}-{}", Utc::now().timestamp(), suffix)
}

impl Manifest {
    pub fn new(source: &str, destination: &str, chunk_size: u64) -> Self {
        Self {
            id: new_transfer_id(),
            created_at: Utc::now(),
            source: source.to_string(),
            destination: destination.to_string(),
            chunk_size,
            total_files: 0,
            total_size: 0,
            status: std::sync::Mutex::new((ManifestStatus::Pending, None)),
            batches: Vec::new(),
        }
    }

    /// Append a batch with the next dense id and fold its totals in.
    pub fn push_batch(&mut self, files: Vec<String>, size: u64) {
        let id = self.batches.len();
        self.total_files += files.len() as u64;
        self.total_size += size;
        self.batches
            .push(std::sync::Arc::new(Batch::new(id, files, size)));
    }

    pub fn status(&self) -> ManifestStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .0
    }

    pub fn set_status(&self, status: ManifestStatus) {
        let mut guard = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.0 = status;
        if matches!(status, ManifestStatus::Completed | ManifestStatus::Failed) {
            guard.1 = Some(Utc::now());
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.batches.iter().all(|b| b.status().is_terminal())
    }

    pub fn all_completed(&self) -> bool {
        self.batches
            .iter()
            .all(|b| b.status() == BatchStatus::Completed)
    }

    pub fn count_with_status(&self, status: BatchStatus) -> usize {
        self.batches.iter().filter(|b| b.status() == status).count()
    }

    /// Write the manifest document atomically. The snapshot is taken batch
    /// by batch under each batch's own lock.
    pub async fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create checkpoint directory {:?}", parent))?;
        }
        let doc = self.to_doc();
        let data = serde_json::to_vec_pretty(&doc).context("failed to serialize manifest")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("failed to write checkpoint {:?}", tmp))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("failed to move checkpoint into place at {:?}", path))?;
        Ok(())
    }

    pub async fn load(path: &std::path::Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read checkpoint {:?}", path))?;
        let doc: ManifestDoc =
            serde_json::from_slice(&data).context("failed to parse manifest document")?;
        Ok(Self::from_doc(doc))
    }

    fn to_doc(&self) -> ManifestDoc {
        let status = {
            let guard = self
                .status
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (guard.0, guard.1)
        };
        ManifestDoc {
            id: self.id.clone(),
            created_at: self.created_at,
            source: self.source.clone(),
            destination: self.destination.clone(),
            chunk_size: self.chunk_size,
            total_files: self.total_files,
            total_size: self.total_size,
            status: status.0,
            completed_at: status.1,
            batches: self
                .batches
                .iter()
                .map(|batch| {
                    let state = batch.snapshot();
                    BatchDoc {
                        id: batch.id,
                        files: batch.files.clone(),
                        size: state.size,
                        source_size: batch.source_size,
                        file_count: batch.file_count,
                        status: state.status,
                        local_path: state.local_path,
                        error: state.error,
                        started_at: state.started_at,
                        completed_at: state.completed_at,
                        checksum: state.checksum,
                    }
                })
                .collect(),
        }
    }

    fn from_doc(doc: ManifestDoc) -> Self {
        let batches = doc
            .batches
            .into_iter()
            .map(|b| {
                let mut batch = Batch::new(b.id, b.files, b.size);
                // documents written before size reconciliation carry no
                // separate source size; fall back to the recorded size
                batch.source_size = if b.source_size > 0 { b.source_size } else { b.size };
                {
                    let mut state = batch.lock();
                    state.status = b.status;
                    state.local_path = b.local_path;
                    state.error = b.error;
                    state.started_at = b.started_at;
                    state.completed_at = b.completed_at;
                    state.checksum = b.checksum;
                }
                std::sync::Arc::new(batch)
            })
            .collect();
        Self {
            id: doc.id,
            created_at: doc.created_at,
            source: doc.source,
            destination: doc.destination,
            chunk_size: doc.chunk_size,
            total_files: doc.total_files,
            total_size: doc.total_size,
            status: std::sync::Mutex::new((doc.status, doc.completed_at)),
            batches,
        }
    }
}

/// Serialized form of the manifest. Field names are stable; unknown fields
/// from newer versions are ignored and optional fields default.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestDoc {
    id: String,
    created_at: DateTime<Utc>,
    source: String,
    destination: String,
    chunk_size: u64,
    total_files: u64,
    total_size: u64,
    status: ManifestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    batches: Vec<BatchDoc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchDoc {
    id: usize,
    files: Vec<String>,
    size: u64,
    #[serde(default)]
    source_size: u64,
    file_count: usize,
    status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    local_path: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}
