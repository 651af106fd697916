//! Source worker pool: archives batches into the buffer.
//!
//! Each worker pulls a batch from the bounded queue, claims buffer space
//! (waiting with a short pause while the buffer is full), writes the
//! batch's file list to a temp file and drives the tar pipeline. The
//! transition to `buffered` happens only after the archive is closed on
//! disk and its size reconciled against the reservation.

use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};

use crate::buffer::BufferManager;
use crate::manifest::{Batch, BatchStatus};
use common::TransferProgress;
use exec::{shell_escape, Executor};

/// How long a worker pauses between reservation attempts when the buffer
/// is full.
const RESERVE_RETRY_PAUSE: std::time::Duration = std::time::Duration::from_millis(10);

/// Claim `size` bytes from the buffer, retrying until space frees up or
/// the transfer is cancelled.
pub(crate) async fn reserve_blocking(
    buffer: &BufferManager,
    size: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    while !buffer.reserve(size) {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(anyhow!("stopped while waiting for buffer space"));
            }
            _ = tokio::time::sleep(RESERVE_RETRY_PAUSE) => {}
        }
    }
    Ok(())
}

/// Everything a source worker needs, shared across the pool.
pub struct SourceContext {
    pub executor: Arc<Executor>,
    pub source_root: String,
    pub manifest_id: String,
    pub buffer: Arc<BufferManager>,
    pub progress: &'static TransferProgress,
}

pub struct SourcePool {
    tx: tokio::sync::mpsc::Sender<Arc<Batch>>,
    workers: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl SourcePool {
    /// Start `num_workers` workers. Returns the pool handle and the error
    /// channel the dispatcher monitors.
    pub fn start(
        ctx: Arc<SourceContext>,
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

    /// Add a batch to the work queue; bails out when the pool is stopped
    /// so callers never block forever on a full queue.
    pub async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("source pool stopped")),
            result = self.tx.send(batch) => {
                result.map_err(|_| anyhow!("source pool queue closed"))
            }
        }
    }

    /// Broadcast cancellation and join all workers. Workers finish their
    /// current subprocess call; nothing is forcibly killed.
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
    ctx: Arc<SourceContext>,
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
            "source worker {} picked up batch {}",
            worker_id,
            batch.id
        );
        if let Err(error) = process_batch(&ctx, &batch, &cancel).await {
            let error = error.context(format!(
                "source worker {}: batch {} failed",
                worker_id, batch.id
            ));
            batch.set_error(&error);
            ctx.progress.batches_failed.inc();
            ctx.progress.batches.finished.inc();
            // the first error wins; drop the rest rather than block
            let _ = err_tx.try_send(error);
        }
    }
}

async fn process_batch(
    ctx: &SourceContext,
    batch: &Arc<Batch>,
    cancel: &CancellationToken,
) -> Result<()> {
    ctx.buffer.ensure_batch_dir(&ctx.manifest_id).await?;
    let archive_path = ctx.buffer.batch_path(&ctx.manifest_id, batch.id);
    let declared_size = batch.size();
    reserve_blocking(&ctx.buffer, declared_size, cancel).await?;
    batch.set_status(BatchStatus::Downloading);
    ctx.progress.batches.started.inc();

    let result = archive_batch(ctx, batch, &archive_path).await;
    let actual_size = match result {
        Ok(size) => size,
        Err(error) => {
            ctx.buffer.release(declared_size);
            return Err(error);
        }
    };

    // the declared size was an estimate; reconcile the reservation with
    // what tar actually produced
    if actual_size > declared_size {
        if let Err(error) =
            reserve_blocking(&ctx.buffer, actual_size - declared_size, cancel).await
        {
            ctx.buffer.release(declared_size);
            return Err(error);
        }
    } else if actual_size < declared_size {
        ctx.buffer.release(declared_size - actual_size);
    }

    batch.set_buffered(archive_path, actual_size);
    ctx.progress.batches_buffered.inc();
    ctx.progress.bytes_archived.add(actual_size);
    event!(
        Level::DEBUG,
        "batch {} buffered ({} bytes)",
        batch.id,
        actual_size
    );
    Ok(())
}

fn write_file_list(batch: &Batch) -> Result<tempfile::NamedTempFile> {
    let mut list = tempfile::Builder::new()
        .prefix("ferry-list-")
        .suffix(".txt")
        .tempfile()
        .context("failed to create file list")?;
    for file in &batch.files {
        writeln!(list, "{}", file).context("failed to write file list")?;
    }
    list.flush().context("failed to flush file list")?;
    Ok(list)
}

/// Produce the batch archive and return its byte length.
async fn archive_batch(
    ctx: &SourceContext,
    batch: &Arc<Batch>,
    archive_path: &std::path::Path,
) -> Result<u64> {
    let list = write_file_list(batch)?;
    if ctx.executor.is_remote() {
        archive_remote(ctx, list.path(), archive_path).await?;
    } else {
        archive_local(ctx, list.path(), archive_path).await?;
    }
    let metadata = tokio::fs::metadata(archive_path)
        .await
        .with_context(|| format!("failed to stat archive {:?}", archive_path))?;
    Ok(metadata.len())
}

async fn archive_local(
    ctx: &SourceContext,
    list_path: &std::path::Path,
    archive_path: &std::path::Path,
) -> Result<()> {
    let cmd = format!(
        "tar czf {} -C {} -T {}",
        shell_escape(&archive_path.display().to_string()),
        shell_escape(&ctx.source_root),
        shell_escape(&list_path.display().to_string()),
    );
    let output = ctx.executor.run(&cmd).await?;
    if !output.success() {
        anyhow::bail!(
            "tar failed with exit code {}: {}",
            output.exit_code,
            output.stderr_utf8().trim()
        );
    }
    Ok(())
}

/// Stream the file list into a remote `tar czf -` and redirect its stdout
/// into the buffer file.
async fn archive_remote(
    ctx: &SourceContext,
    list_path: &std::path::Path,
    archive_path: &std::path::Path,
) -> Result<()> {
    let cmd = format!("cd {} && tar czf - -T -", shell_escape(&ctx.source_root));
    let mut streamed = ctx.executor.stream(&cmd).await?;
    let mut stdin = streamed
        .take_stdin()
        .context("archive pipeline has no stdin")?;
    let mut stdout = streamed
        .take_stdout()
        .context("archive pipeline has no stdout")?;
    let mut list = tokio::fs::File::open(list_path)
        .await
        .with_context(|| format!("failed to open file list {:?}", list_path))?;
    let mut archive = tokio::fs::File::create(archive_path)
        .await
        .with_context(|| format!("failed to create archive {:?}", archive_path))?;
    let feed_list = async {
        tokio::io::copy(&mut list, &mut stdin)
            .await
            .context("failed to stream file list")?;
        stdin.shutdown().await.context("failed to close tar stdin")?;
        drop(stdin);
        Ok::<_, anyhow::Error>(())
    };
    let collect_archive = async {
        tokio::io::copy(&mut stdout, &mut archive)
            .await
            .context("failed to write archive to buffer")?;
        archive
            .sync_all()
            .await
            .context("failed to sync archive to disk")?;
        Ok::<_, anyhow::Error>(())
    };
    let (feed_result, collect_result) = tokio::join!(feed_list, collect_archive);
    feed_result?;
    collect_result?;
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

    fn context(source_root: &str, buffer: Arc<BufferManager>) -> Arc<SourceContext> {
        Arc::new(SourceContext {
            executor: Arc::new(Executor::local()),
            source_root: source_root.to_string(),
            manifest_id: "transfer-test".to_string(),
            buffer,
            progress: &PROGRESS,
        })
    }

    #[test(tokio::test)]
    async fn archives_a_batch_and_reconciles_size() {
        let src_dir = tempfile::tempdir().unwrap();
        testutils::write_tree(src_dir.path(), &[("a.txt", 64), ("sub/b.txt", 128)])
            .await
            .unwrap();
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let ctx = context(src_dir.path().to_str().unwrap(), buffer.clone());
        let batch = Arc::new(Batch::new(
            0,
            vec!["a.txt".to_string(), "sub/b.txt".to_string()],
            192,
        ));
        let cancel = CancellationToken::new();
        process_batch(&ctx, &batch, &cancel).await.unwrap();
        assert_eq!(batch.status(), BatchStatus::Buffered);
        let archive = batch.local_path().unwrap();
        assert!(archive.exists());
        let archive_len = std::fs::metadata(&archive).unwrap().len();
        assert_eq!(batch.size(), archive_len);
        // reservation tracks the reconciled size, not the declared one
        assert_eq!(buffer.current(), archive_len);
    }

    #[test(tokio::test)]
    async fn failed_archive_releases_reservation() {
        let src_dir = tempfile::tempdir().unwrap();
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let ctx = context(src_dir.path().to_str().unwrap(), buffer.clone());
        // the listed file does not exist, so tar exits non-zero
        let batch = Arc::new(Batch::new(0, vec!["missing.txt".to_string()], 100));
        let cancel = CancellationToken::new();
        let error = process_batch(&ctx, &batch, &cancel).await.unwrap_err();
        assert!(format!("{:#}", error).contains("tar"), "{:#}", error);
        assert_eq!(buffer.current(), 0);
    }

    #[test(tokio::test)]
    async fn reserve_loop_unblocks_on_cancellation() {
        let buffer = BufferManager::new(std::env::temp_dir().join("x"), 100);
        assert!(buffer.reserve(100));
        let cancel = CancellationToken::new();
        let waiter = reserve_blocking(&buffer, 50, &cancel);
        tokio::pin!(waiter);
        // the reservation cannot succeed; only cancellation releases it
        tokio::select! {
            _ = &mut waiter => panic!("reserve should not succeed"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
        }
        cancel.cancel();
        let result = waiter.await;
        assert!(result.is_err());
    }

    #[test(tokio::test)]
    async fn stop_unblocks_a_waiting_enqueue() {
        let src_dir = tempfile::tempdir().unwrap();
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = Arc::new(BufferManager::new(buffer_root.path().to_path_buf(), 10_000));
        let ctx = context(src_dir.path().to_str().unwrap(), buffer);
        let cancel = CancellationToken::new();
        let (pool, _errors) = SourcePool::start(ctx, 1, cancel.clone());
        cancel.cancel();
        // workers are gone; the queue would fill, but enqueue observes the
        // cancellation instead of blocking forever
        for i in 0..10 {
            let batch = Arc::new(Batch::new(i, vec![], 0));
            if pool.enqueue(batch).await.is_err() {
                pool.stop().await;
                return;
            }
        }
        panic!("enqueue never observed the stopped pool");
    }
}
