//! Destination worker pool: extracts buffered archives at the destination.
//!
//! On success the archive is deleted through the buffer manager (when
//! cleanup is enabled) so reservation accounting stays consistent. On
//! failure the archive stays on disk for forensics and resume.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::buffer::BufferManager;
use crate::manifest::{Batch, BatchStatus};
use common::TransferProgress;
use exec::{shell_escape, Executor};

/// Everything a destination worker needs, shared across the pool.
pub struct DestContext {
    pub executor: Arc<Executor>,
    pub dest_root: String,
    pub buffer: Arc<BufferManager>,
    pub cleanup_buffer: bool,
    pub progress: &'static TransferProgress,
}

pub struct DestPool {
    tx: tokio::sync::mpsc::Sender<Arc<Batch>>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl DestPool {
    pub fn start(
        ctx: Arc<DestContext>,
        num_workers: usize,
        cancel: CancellationToken,
    ) -> (Self, tokio::sync::mpsc::Receiver<anyhow::Error>) {
        let (tx, rx) = tokio::sync::mpsc::channel::<Arc<Batch>>(num_workers * 2);
        let (err_tx, err_rx) = tokio::sync::mpsc::channel(num_workers);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..num_workers)
            .map(|worker_id| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                let err_tx = err_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    worker(worker_id, ctx, rx, err_tx, cancel).await;
                })
            })
            .collect();
        (
            Self {
                tx,
                workers: std::sync::Mutex::new(workers),
                cancel,
            },
            err_rx,
        )
    }

    pub async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("destination pool stopped")),
            result = self.tx.send(batch) => {
                result.map_err(|_| anyhow!("destination pool queue closed"))
            }
        }
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let workers = {
            let mut guard = self
                .workers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker(
    worker_id: usize,
    ctx: Arc<DestContext>,
    rx: Arc<tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Arc<Batch>>>>,
    err_tx: tokio::sync::mpsc::Sender<anyhow::Error>,
    cancel: CancellationToken,
) {
    loop {
        let batch = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                batch = rx.recv() => match batch {
                    Some(batch) => batch,
                    None => return,
                },
            }
        };
        event!(
            Level::DEBUG,
            "destination worker {} picked up batch {}",
            worker_id,
            batch.id
        );
        if let Err(error) = process_batch(&ctx, &batch).await {
            let error = error.context(format!(
                "destination worker {}: batch {} failed",
                worker_id, batch.id
            ));
            batch.set_error(&error);
            ctx.progress.batches_failed.inc();
            ctx.progress.batches.finished.inc();
            let _ = err_tx.try_send(error);
        }
    }
}

async fn process_batch(ctx: &DestContext, batch: &Arc<Batch>) -> Result<()> {
    batch.set_status(BatchStatus::Uploading);
    let archive_path = batch
        .local_path()
        .ok_or_else(|| anyhow!("batch {} has no buffered archive", batch.id))?;

    // a failed extraction leaves the archive in the buffer on purpose
    extract_archive(ctx, &archive_path).await?;

    if ctx.cleanup_buffer {
        if let Err(error) = ctx.buffer.delete_batch(&archive_path, batch.size()).await {
            event!(
                Level::WARN,
                "failed to delete batch {} from buffer: {:#}",
                batch.id,
                error
            );
        }
    }
    batch.set_status(BatchStatus::Completed);
    ctx.progress.files_done.add(batch.file_count as u64);
    // report source bytes, not archive bytes
    ctx.progress.bytes_done.add(batch.source_size);
    ctx.progress.batches.finished.inc();
    event!(Level::DEBUG, "batch {} completed", batch.id);
    Ok(())
}

async fn extract_archive(ctx: &DestContext, archive_path: &std::path::Path) -> Result<()> {
    if ctx.executor.is_remote() {
        extract_remote(ctx, archive_path).await
    } else {
        let cmd = format!(
            "tar xzf {} -C {}",
            shell_escape(&archive_path.display().to_string()),
            shell_escape(&ctx.dest_root),
        );
        let output = ctx.executor.run(&cmd).await?;
        if !output.success() {
            anyhow::bail!(
                "tar extract failed with exit code {}: {}",
                output.exit_code,
                output.stderr_utf8().trim()
            );
        }
        Ok(())
    }
}

/// Stream the archive into a remote `tar xzf -`.
async fn extract_remote(ctx: &DestContext, archive_path: &std::path::Path) -> Result<()> {
    let cmd = format!("tar xzf - -C {}", shell_escape(&ctx.dest_root));
    let mut streamed = ctx.executor.stream_write(&cmd).await?;
    let mut stdin = streamed
        .take_stdin()
        .context("extract pipeline has no stdin")?;
    let mut archive = tokio::fs::File::open(archive_path)
        .await
        .with_context(|| format!("failed to open archive {:?}", archive_path))?;
    tokio::io::copy(&mut archive, &mut stdin)
        .await
        .context("failed to stream archive to destination")?;
    stdin
        .shutdown()
        .await
        .context("failed to close extract stdin")?;
    drop(stdin);
    streamed.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testutils;
    use test_log::test;

    lazy_static::lazy_static! {
        static ref PROGRESS: TransferProgress = TransferProgress::new();
    }

    async fn buffered_batch(
        src_dir: &std::path::Path,
        buffer: &BufferManager,
        files: &[&str],
    ) -> Arc<Batch> {
        buffer.ensure_batch_dir("transfer-test").await.unwrap();
        let archive_path = buffer.batch_path("transfer-test", 0);
        let list = files.join(" ");
        let exec = Executor::local();
        let output = exec
            .run(&format!(
                "tar czf {} -C {} {}",
                shell_escape(&archive_path.display().to_string()),
                shell_escape(&src_dir.display().to_string()),
                list
            ))
            .await
            .unwrap();
        assert!(output.success(), "{}", output.stderr_utf8());
        let size = std::fs::metadata(&archive_path).unwrap().len();
        assert!(buffer.reserve(size));
        let batch = Arc::new(Batch::new(
            0,
            files.iter().map(|f| f.to_string()).collect(),
            size,
        ));
        batch.set_status(BatchStatus::Downloading);
        batch.set_buffered(archive_path, size);
        batch
    }

    #[test(tokio::test)]
    async fn extracts_and_cleans_up() {
        let src_dir = tempfile::tempdir().unwrap();
        testutils::write_tree(src_dir.path(), &[("a.txt", 20), ("sub/b.txt", 40)])
            .await
            .unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let batch = buffered_batch(src_dir.path(), &buffer, &["a.txt", "sub/b.txt"]).await;
        let archive_path = batch.local_path().unwrap();
        let ctx = DestContext {
            executor: Arc::new(Executor::local()),
            dest_root: dst_dir.path().display().to_string(),
            buffer: buffer.clone(),
            cleanup_buffer: true,
            progress: &PROGRESS,
        };
        process_batch(&ctx, &batch).await.unwrap();
        assert_eq!(batch.status(), BatchStatus::Completed);
        testutils::assert_trees_identical(src_dir.path(), dst_dir.path());
        // archive deleted and reservation returned
        assert!(!archive_path.exists());
        assert_eq!(buffer.current(), 0);
    }

    #[test(tokio::test)]
    async fn failed_extraction_preserves_archive() {
        let src_dir = tempfile::tempdir().unwrap();
        testutils::write_tree(src_dir.path(), &[("a.txt", 20)]).await.unwrap();
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let batch = buffered_batch(src_dir.path(), &buffer, &["a.txt"]).await;
        let archive_path = batch.local_path().unwrap();
        let reserved = buffer.current();
        let ctx = DestContext {
            executor: Arc::new(Executor::local()),
            dest_root: "/does/not/exist/ferry-dst".to_string(),
            buffer: buffer.clone(),
            cleanup_buffer: true,
            progress: &PROGRESS,
        };
        let error = process_batch(&ctx, &batch).await.unwrap_err();
        assert!(format!("{:#}", error).contains("tar"), "{:#}", error);
        assert!(archive_path.exists());
        assert_eq!(buffer.current(), reserved);
    }

    #[test(tokio::test)]
    async fn batch_without_archive_is_an_error() {
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let ctx = DestContext {
            executor: Arc::new(Executor::local()),
            dest_root: "/tmp".to_string(),
            buffer,
            cleanup_buffer: false,
            progress: &PROGRESS,
        };
        let batch = Arc::new(Batch::new(3, vec!["a".to_string()], 10));
        let error = process_batch(&ctx, &batch).await.unwrap_err();
        assert!(format!("{}", error).contains("no buffered archive"));
    }
}
