//! Bounded on-disk staging area between the source and destination pools.
//!
//! Admission is controlled exclusively by the reservation counter; the
//! filesystem is never consulted to decide whether an archive fits.
//! `reserve` must happen before bytes are produced into the batch path and
//! `release` only after the destination no longer needs the file.

use anyhow::{Context, Result};
use tracing::{event, instrument, Level};

#[derive(Debug)]
pub struct BufferManager {
    root: std::path::PathBuf,
    max_size: u64,
    current: std::sync::atomic::AtomicU64,
}

impl BufferManager {
    pub fn new(root: std::path::PathBuf, max_size: u64) -> Self {
        Self {
            root,
            max_size,
            current: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Create the buffer root. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create buffer directory {:?}", self.root))?;
        Ok(())
    }

    pub async fn ensure_batch_dir(&self, manifest_id: &str) -> Result<()> {
        let dir = self.root.join(manifest_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create batch directory {:?}", dir))?;
        Ok(())
    }

    pub fn batch_path(&self, manifest_id: &str, batch_id: usize) -> std::path::PathBuf {
        self.root
            .join(manifest_id)
            .join(format!("batch_{:05}.tar.gz", batch_id))
    }

    pub fn manifest_dir(&self, manifest_id: &str) -> std::path::PathBuf {
        self.root.join(manifest_id)
    }

    /// Try to claim `size` bytes. Returns false when the claim would push
    /// usage past the cap; never blocks.
    pub fn reserve(&self, size: u64) -> bool {
        loop {
            let current = self.current.load(std::sync::atomic::Ordering::Acquire);
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > self.max_size {
                return false;
            }
            if self
                .current
                .compare_exchange(
                    current,
                    next,
                    std::sync::atomic::Ordering::AcqRel,
                    std::sync::atomic::Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
            // lost the race, retry with the fresh value
        }
    }

    /// Return `size` bytes to the pool. Saturates at zero so an earlier
    /// reservation adjustment can never underflow the counter.
    pub fn release(&self, size: u64) {
        let _ = self.current.fetch_update(
            std::sync::atomic::Ordering::AcqRel,
            std::sync::atomic::Ordering::Acquire,
            |current| Some(current.saturating_sub(size)),
        );
    }

    /// Unlink an archive and release its reservation.
    pub async fn delete_batch(&self, path: &std::path::Path, size: u64) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| format!("failed to delete batch {:?}", path))
            }
        }
        self.release(size);
        Ok(())
    }

    /// Remove the per-manifest directory and reset the counter.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, manifest_id: &str) -> Result<()> {
        let dir = self.manifest_dir(manifest_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| format!("failed to clean up buffer {:?}", dir))
            }
        }
        self.current.store(0, std::sync::atomic::Ordering::Release);
        event!(Level::DEBUG, "buffer cleaned up at {:?}", dir);
        Ok(())
    }

    pub fn current(&self) -> u64 {
        self.current.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        self.current() as f64 / self.max_size as f64
    }

    pub fn is_full(&self) -> bool {
        self.utilization() >= 0.95
    }

    pub fn is_low(&self) -> bool {
        self.utilization() <= 0.10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn manager(max: u64) -> BufferManager {
        BufferManager::new(std::env::temp_dir().join("ferry-buffer-test"), max)
    }

    #[test]
    fn reserve_up_to_cap() {
        let buffer = manager(100);
        assert!(buffer.reserve(60));
        assert!(buffer.reserve(40));
        assert!(!buffer.reserve(1));
        assert_eq!(buffer.current(), 100);
        buffer.release(40);
        assert_eq!(buffer.current(), 60);
        assert!(buffer.reserve(40));
    }

    #[test]
    fn release_saturates() {
        let buffer = manager(100);
        assert!(buffer.reserve(10));
        buffer.release(50);
        assert_eq!(buffer.current(), 0);
    }

    #[test]
    fn utilization_thresholds() {
        let buffer = manager(100);
        assert!(buffer.is_low());
        assert!(!buffer.is_full());
        assert!(buffer.reserve(95));
        assert!(buffer.is_full());
        assert!((buffer.utilization() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn batch_paths_are_zero_padded() {
        let buffer = manager(100);
        let path = buffer.batch_path("transfer-1-abc", 7);
        assert!(path.ends_with("transfer-1-abc/batch_00007.tar.gz"));
        let path = buffer.batch_path("transfer-1-abc", 12345);
        assert!(path.ends_with("transfer-1-abc/batch_12345.tar.gz"));
    }

    #[test]
    fn reservation_bound_holds_under_contention() {
        let buffer = std::sync::Arc::new(manager(1000));
        let mut handles = vec![];
        for _ in 0..8 {
            let buffer = buffer.clone();
            handles.push(std::thread::spawn(move || {
                let mut held = 0u64;
                for _ in 0..10_000 {
                    if buffer.reserve(7) {
                        held += 7;
                        assert!(buffer.current() <= buffer.max_size());
                        if held >= 70 {
                            buffer.release(held);
                            held = 0;
                        }
                    }
                }
                buffer.release(held);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.current(), 0);
    }

    #[test(tokio::test)]
    async fn cleanup_removes_directory_and_resets() {
        let root = tempfile::tempdir().unwrap();
        let buffer = BufferManager::new(root.path().to_path_buf(), 1000);
        buffer.initialize().await.unwrap();
        buffer.ensure_batch_dir("m1").await.unwrap();
        let path = buffer.batch_path("m1", 0);
        tokio::fs::write(&path, b"archive bytes").await.unwrap();
        assert!(buffer.reserve(13));
        buffer.cleanup("m1").await.unwrap();
        assert!(!buffer.manifest_dir("m1").exists());
        assert_eq!(buffer.current(), 0);
    }

    #[test(tokio::test)]
    async fn delete_batch_releases_reservation() {
        let root = tempfile::tempdir().unwrap();
        let buffer = BufferManager::new(root.path().to_path_buf(), 1000);
        buffer.ensure_batch_dir("m1").await.unwrap();
        let path = buffer.batch_path("m1", 0);
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        assert!(buffer.reserve(10));
        buffer.delete_batch(&path, 10).await.unwrap();
        assert!(!path.exists());
        assert_eq!(buffer.current(), 0);
        // deleting an already-missing file is not an error
        buffer.delete_batch(&path, 0).await.unwrap();
    }
}
