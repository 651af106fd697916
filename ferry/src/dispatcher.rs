//! Coordinates one batched transfer: feeds pending batches to the source
//! pool, hands buffered batches to the destination pool exactly once, and
//! shuts the pipeline down on the first pool error.
//!
//! The dispatched id set is the authority for exactly-once delivery;
//! batch status alone is not enough because a batch can sit in the
//! destination queue (still `buffered`) across several poll ticks. The
//! set is owned by the poller task, so no other task can race it.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::manifest::{Batch, BatchStatus, Manifest};

/// The poller wakes up this often to look for newly buffered batches.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Where the dispatcher hands batches off to. Both worker pools implement
/// this; tests substitute instrumented stubs.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn enqueue(&self, batch: Arc<Batch>) -> Result<()>;
}

#[async_trait::async_trait]
impl BatchSink for crate::source::SourcePool {
    async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
        crate::source::SourcePool::enqueue(self, batch).await
    }
}

#[async_trait::async_trait]
impl BatchSink for crate::destination::DestPool {
    async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
        crate::destination::DestPool::enqueue(self, batch).await
    }
}

/// Drive the manifest to a terminal state.
///
/// Returns once every batch is `completed` or `failed`, or with the first
/// pool error after broadcasting cancellation.
#[instrument(skip_all, fields(manifest_id = %manifest.id))]
pub async fn run(
    manifest: Arc<Manifest>,
    source: Arc<dyn BatchSink>,
    dest: Arc<dyn BatchSink>,
    mut source_errors: tokio::sync::mpsc::Receiver<anyhow::Error>,
    mut dest_errors: tokio::sync::mpsc::Receiver<anyhow::Error>,
    cancel: CancellationToken,
    poll_interval: std::time::Duration,
) -> Result<()> {
    let feeder = {
        let manifest = manifest.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            for batch in &manifest.batches {
                if cancel.is_cancelled() {
                    return;
                }
                match batch.status() {
                    // resumed batches that are already buffered or done
                    // are the poller's business, not the source pool's
                    BatchStatus::Pending => {}
                    _ => continue,
                }
                if source.enqueue(batch.clone()).await.is_err() {
                    return;
                }
            }
            event!(Level::DEBUG, "all pending batches fed to source pool");
        })
    };

    let mut poller = {
        let manifest = manifest.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut dispatched = std::collections::HashSet::new();
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }
                for batch in &manifest.batches {
                    if batch.status() == BatchStatus::Buffered && !dispatched.contains(&batch.id)
                    {
                        dest.enqueue(batch.clone())
                            .await
                            .with_context(|| format!("failed to dispatch batch {}", batch.id))?;
                        dispatched.insert(batch.id);
                    }
                }
                if manifest.all_terminal() {
                    event!(Level::DEBUG, "all batches terminal, poller exiting");
                    return Ok::<_, anyhow::Error>(());
                }
            }
        })
    };

    let mut poller_done = false;
    let result = loop {
        tokio::select! {
            Some(error) = source_errors.recv() => {
                break Err(error.context("source pool error"));
            }
            Some(error) = dest_errors.recv() => {
                break Err(error.context("destination pool error"));
            }
            res = &mut poller, if !poller_done => {
                poller_done = true;
                break match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(error)) => Err(error),
                    Err(join_error) => Err(anyhow!("destination poller panicked: {}", join_error)),
                };
            }
            _ = cancel.cancelled() => {
                break Err(anyhow!("transfer stopped"));
            }
        }
    };

    // first error (or completion) stops everything else
    cancel.cancel();
    let _ = feeder.await;
    if !poller_done {
        let _ = poller.await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    /// Stub source pool: marks batches buffered after a short, id-staggered
    /// delay so completion order is scrambled.
    struct StubSource;

    #[async_trait::async_trait]
    impl BatchSink for StubSource {
        async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
            tokio::spawn(async move {
                let jitter = (batch.id * 7) % 23;
                tokio::time::sleep(std::time::Duration::from_millis(jitter as u64)).await;
                batch.set_status(BatchStatus::Downloading);
                batch.set_buffered(
                    std::path::PathBuf::from(format!("/nonexistent/batch_{:05}.tar.gz", batch.id)),
                    batch.size(),
                );
            });
            Ok(())
        }
    }

    /// Stub destination pool: counts receipts per batch id, then completes.
    struct StubDest {
        receipts: std::sync::Mutex<std::collections::HashMap<usize, usize>>,
    }

    impl StubDest {
        fn new() -> Self {
            Self {
                receipts: std::sync::Mutex::new(Default::default()),
            }
        }
    }

    #[async_trait::async_trait]
    impl BatchSink for StubDest {
        async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
            *self
                .receipts
                .lock()
                .unwrap()
                .entry(batch.id)
                .or_insert(0) += 1;
            tokio::spawn(async move {
                let jitter = (batch.id * 5) % 17;
                tokio::time::sleep(std::time::Duration::from_millis(jitter as u64)).await;
                batch.set_status(BatchStatus::Uploading);
                batch.set_status(BatchStatus::Completed);
            });
            Ok(())
        }
    }

    fn manifest_with_batches(n: usize) -> Arc<Manifest> {
        let mut manifest = Manifest::new("/src", "/dst", 1024);
        for i in 0..n {
            manifest.push_batch(vec![format!("file{:04}", i)], 100);
        }
        Arc::new(manifest)
    }

    #[test(tokio::test)]
    async fn each_batch_dispatched_exactly_once() {
        let manifest = manifest_with_batches(100);
        let dest = Arc::new(StubDest::new());
        let result = run(
            manifest.clone(),
            Arc::new(StubSource),
            dest.clone(),
            tokio::sync::mpsc::channel(1).1,
            tokio::sync::mpsc::channel(1).1,
            CancellationToken::new(),
            std::time::Duration::from_millis(10),
        )
        .await;
        result.unwrap();
        assert!(manifest.all_completed());
        let receipts = dest.receipts.lock().unwrap();
        assert_eq!(receipts.len(), 100);
        for (id, count) in receipts.iter() {
            assert_eq!(*count, 1, "batch {} dispatched {} times", id, count);
        }
    }

    #[test(tokio::test)]
    async fn zero_batches_terminate_immediately() {
        let manifest = manifest_with_batches(0);
        let dest = Arc::new(StubDest::new());
        let result = run(
            manifest,
            Arc::new(StubSource),
            dest.clone(),
            tokio::sync::mpsc::channel(1).1,
            tokio::sync::mpsc::channel(1).1,
            CancellationToken::new(),
            std::time::Duration::from_millis(10),
        )
        .await;
        result.unwrap();
        assert!(dest.receipts.lock().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn first_pool_error_cancels_everything() {
        let manifest = manifest_with_batches(4);
        let (err_tx, err_rx) = tokio::sync::mpsc::channel(1);
        err_tx
            .send(anyhow!("tar failed with exit code 2"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let result = run(
            manifest,
            Arc::new(StubSource),
            Arc::new(StubDest::new()),
            err_rx,
            tokio::sync::mpsc::channel(1).1,
            cancel.clone(),
            std::time::Duration::from_millis(10),
        )
        .await;
        let error = result.unwrap_err();
        assert!(format!("{:#}", error).contains("source pool error"));
        assert!(cancel.is_cancelled());
    }

    /// A source-side failure is terminal for its batch; the run still
    /// drains the rest and the failed batch never reaches the destination.
    struct FlakySource;

    #[async_trait::async_trait]
    impl BatchSink for FlakySource {
        async fn enqueue(&self, batch: Arc<Batch>) -> Result<()> {
            tokio::spawn(async move {
                if batch.id == 2 {
                    batch.set_error(&anyhow!("archive failed"));
                } else {
                    batch.set_status(BatchStatus::Downloading);
                    batch.set_buffered(
                        std::path::PathBuf::from(format!("/nonexistent/{}.tar.gz", batch.id)),
                        batch.size(),
                    );
                }
            });
            Ok(())
        }
    }

    #[test(tokio::test)]
    async fn failed_batches_are_terminal_and_not_dispatched() {
        let manifest = manifest_with_batches(5);
        let dest = Arc::new(StubDest::new());
        run(
            manifest.clone(),
            Arc::new(FlakySource),
            dest.clone(),
            tokio::sync::mpsc::channel(1).1,
            tokio::sync::mpsc::channel(1).1,
            CancellationToken::new(),
            std::time::Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(manifest.all_terminal());
        assert!(!manifest.all_completed());
        assert_eq!(manifest.count_with_status(BatchStatus::Failed), 1);
        let receipts = dest.receipts.lock().unwrap();
        assert!(!receipts.contains_key(&2));
        assert_eq!(receipts.len(), 4);
    }
}
