//! Checkpoint state for the non-tar strategies.
//!
//! The tar pipeline checkpoints its manifest document directly; the
//! wrapper engines (rsync, rclone, proxy) record this coarser state so an
//! interrupted run can be picked up later. An auto-saver task writes the
//! document on an interval and once more on shutdown.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

/// Where the wrapper engines keep their checkpoint documents.
pub fn default_checkpoint_dir() -> std::path::PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => std::path::PathBuf::from(home).join(".ferry").join("checkpoints"),
        None => std::env::temp_dir().join("ferry-checkpoints"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub transfer_id: String,
    pub source: String,
    pub destination: String,
    pub strategy: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub files_done: u64,
    pub files_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default)]
    pub completed_files: Vec<String>,
    #[serde(default)]
    pub failed_files: std::collections::BTreeMap<String, String>,
}

impl CheckpointState {
    pub fn new(transfer_id: &str, source: &str, destination: &str, strategy: &str) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: transfer_id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            strategy: strategy.to_string(),
            start_time: now,
            last_update: now,
            bytes_done: 0,
            bytes_total: 0,
            files_done: 0,
            files_total: 0,
            current_file: None,
            completed_files: Vec::new(),
            failed_files: Default::default(),
        }
    }
}

/// Stores checkpoint documents under one directory, one JSON file per
/// transfer id.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: std::path::PathBuf,
}

impl CheckpointManager {
    pub async fn new(dir: std::path::PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create checkpoint directory {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path_for(&self, transfer_id: &str) -> std::path::PathBuf {
        self.dir.join(format!("{}.json", transfer_id))
    }

    pub async fn save(&self, state: &CheckpointState) -> Result<()> {
        let mut state = state.clone();
        state.last_update = Utc::now();
        let data = serde_json::to_vec_pretty(&state).context("failed to serialize checkpoint")?;
        let path = self.path_for(&state.transfer_id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("failed to write checkpoint {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move checkpoint into place at {:?}", path))?;
        Ok(())
    }

    pub async fn load(&self, transfer_id: &str) -> Result<CheckpointState> {
        let path = self.path_for(transfer_id);
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("checkpoint not found: {}", transfer_id))?;
        serde_json::from_slice(&data).context("failed to parse checkpoint document")
    }

    pub async fn exists(&self, transfer_id: &str) -> bool {
        tokio::fs::metadata(self.path_for(transfer_id)).await.is_ok()
    }

    pub async fn delete(&self, transfer_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(transfer_id)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed to delete checkpoint {}", transfer_id))
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read checkpoint directory {:?}", self.dir))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Remove checkpoints whose file modification time is older than
    /// `max_age`.
    pub async fn clean(&self, max_age: std::time::Duration) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read checkpoint directory {:?}", self.dir))?;
        let cutoff = std::time::SystemTime::now() - max_age;
        let mut cleaned = 0;
        while let Some(entry) = entries.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            if modified < cutoff && tokio::fs::remove_file(entry.path()).await.is_ok() {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

/// Saves a shared checkpoint state on an interval, plus a final save when
/// stopped.
pub struct AutoSaver {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl AutoSaver {
    pub fn start(
        manager: std::sync::Arc<CheckpointManager>,
        state: std::sync::Arc<std::sync::Mutex<CheckpointState>>,
        interval: std::time::Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                if let Err(error) = manager.save(&snapshot).await {
                    event!(Level::WARN, "periodic checkpoint save failed: {:#}", error);
                }
            }
            // one final save so the document reflects the end state
            let snapshot = state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            if let Err(error) = manager.save(&snapshot).await {
                event!(Level::WARN, "final checkpoint save failed: {:#}", error);
            }
        });
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf()).await.unwrap();
        let mut state = CheckpointState::new("transfer-9-xyz", "/src", "host:/dst", "rsync");
        state.bytes_total = 1000;
        state.files_total = 10;
        state.completed_files.push("a.txt".to_string());
        state
            .failed_files
            .insert("b.txt".to_string(), "permission denied".to_string());
        manager.save(&state).await.unwrap();
        assert!(manager.exists("transfer-9-xyz").await);

        let loaded = manager.load("transfer-9-xyz").await.unwrap();
        assert_eq!(loaded.transfer_id, state.transfer_id);
        assert_eq!(loaded.bytes_total, 1000);
        assert_eq!(loaded.completed_files, vec!["a.txt"]);
        assert_eq!(
            loaded.failed_files.get("b.txt").map(String::as_str),
            Some("permission denied")
        );
        // save() refreshes last_update
        assert!(loaded.last_update >= state.start_time);
    }

    #[test(tokio::test)]
    async fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path().to_path_buf()).await.unwrap();
        for id in ["transfer-1-a", "transfer-2-b"] {
            manager
                .save(&CheckpointState::new(id, "/s", "/d", "rclone"))
                .await
                .unwrap();
        }
        assert_eq!(
            manager.list().await.unwrap(),
            vec!["transfer-1-a", "transfer-2-b"]
        );
        manager.delete("transfer-1-a").await.unwrap();
        assert_eq!(manager.list().await.unwrap(), vec!["transfer-2-b"]);
        // deleting a missing checkpoint is fine
        manager.delete("transfer-1-a").await.unwrap();
    }

    #[test(tokio::test)]
    async fn autosaver_writes_final_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            std::sync::Arc::new(CheckpointManager::new(dir.path().to_path_buf()).await.unwrap());
        let state = std::sync::Arc::new(std::sync::Mutex::new(CheckpointState::new(
            "transfer-3-c",
            "/s",
            "/d",
            "proxy",
        )));
        let saver = AutoSaver::start(manager.clone(), state.clone(), std::time::Duration::from_secs(60));
        state.lock().unwrap().bytes_done = 512;
        saver.stop().await;
        let loaded = manager.load("transfer-3-c").await.unwrap();
        assert_eq!(loaded.bytes_done, 512);
    }
}
