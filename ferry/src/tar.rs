//! The batched tar pipeline.
//!
//! Builds (or resumes) a manifest, initializes the buffer, starts the two
//! worker pools and runs the dispatcher, saving the manifest document on
//! an interval. On interrupt the manifest is checkpointed and the buffer
//! conditionally preserved so a later run can resume.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};

use crate::buffer::BufferManager;
use crate::builder;
use crate::destination::{DestContext, DestPool};
use crate::dispatcher::{self, BatchSink};
use crate::engine::{executor_for, format_speed, TransferRequest};
use crate::manifest::{BatchStatus, Manifest, ManifestStatus};
use crate::source::{SourceContext, SourcePool};
use crate::TransferResult;
use common::{CategorizedError, ExitCode, TransferProgress};

/// How often the manifest document is rewritten while the pipeline runs.
const CHECKPOINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug)]
pub struct TarEngine;

impl TarEngine {
    #[instrument(skip_all)]
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let start = std::time::Instant::now();
        let options = &request.options;
        let progress: &'static TransferProgress = &common::PROGRESS;
        let policy = options.host_key_policy;

        let source_exec = Arc::new(
            executor_for(
                &request.source,
                &options.source_auth,
                "FERRY_SOURCE_PASSWORD",
                policy,
            )
            .await?,
        );
        let dest_exec = Arc::new(
            executor_for(
                &request.destination,
                &options.dest_auth,
                "FERRY_DEST_PASSWORD",
                policy,
            )
            .await?,
        );

        let manifest = match &options.resume {
            Some(checkpoint_path) => {
                let manifest = Manifest::load(checkpoint_path).await?;
                event!(
                    Level::INFO,
                    "resuming manifest {} ({} of {} batches completed)",
                    manifest.id,
                    manifest.count_with_status(BatchStatus::Completed),
                    manifest.batches.len()
                );
                manifest
            }
            None => {
                builder::build_manifest(
                    &source_exec,
                    &request.source,
                    &request.source_spec,
                    &request.destination_spec,
                    options.batch.chunk_size,
                )
                .await?
            }
        };

        if options.dry_run {
            return Ok(TransferResult {
                success: true,
                transfer_id: manifest.id.clone(),
                bytes_total: manifest.total_size,
                bytes_done: 0,
                files_total: manifest.total_files,
                files_done: 0,
                duration: start.elapsed(),
                average_speed: "-".to_string(),
                message: format!(
                    "dry run: would transfer {} files in {} batches ({})",
                    manifest.total_files,
                    manifest.batches.len(),
                    bytesize::ByteSize(manifest.total_size)
                ),
                error: None,
            });
        }

        let buffer = Arc::new(BufferManager::new(
            options.buffer.path.clone(),
            options.buffer.max_size,
        ));
        buffer.initialize().await?;
        if options.resume.is_some() {
            prepare_resume(&manifest, &buffer).await?;
        }
        progress.set_totals(manifest.total_size, manifest.total_files);

        let manifest = Arc::new(manifest);
        manifest.set_status(ManifestStatus::InProgress);
        if options.checkpoint.enabled {
            if let Err(error) = manifest.save(&options.checkpoint.path).await {
                event!(Level::WARN, "initial checkpoint save failed: {:#}", error);
            }
        }
        event!(
            Level::INFO,
            "manifest {}: {} files, {} batches, {} total",
            manifest.id,
            manifest.total_files,
            manifest.batches.len(),
            bytesize::ByteSize(manifest.total_size)
        );

        let cancel = CancellationToken::new();
        let source_ctx = Arc::new(SourceContext {
            executor: source_exec,
            source_root: request.source.path.clone(),
            manifest_id: manifest.id.clone(),
            buffer: buffer.clone(),
            progress,
        });
        let dest_ctx = Arc::new(DestContext {
            executor: dest_exec,
            dest_root: request.destination.path.clone(),
            buffer: buffer.clone(),
            cleanup_buffer: options.buffer.cleanup,
            progress,
        });
        let (source_pool, source_errors) =
            SourcePool::start(source_ctx, options.batch.source_workers, cancel.clone());
        let (dest_pool, dest_errors) =
            DestPool::start(dest_ctx, options.batch.dest_workers, cancel.clone());
        let source_pool = Arc::new(source_pool);
        let dest_pool = Arc::new(dest_pool);
        event!(
            Level::DEBUG,
            "started {} source and {} destination workers",
            options.batch.source_workers,
            options.batch.dest_workers
        );

        let autosaver = options.checkpoint.enabled.then(|| {
            let manifest = manifest.clone();
            let path = options.checkpoint.path.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CHECKPOINT_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    if let Err(error) = manifest.save(&path).await {
                        event!(Level::WARN, "periodic checkpoint save failed: {:#}", error);
                    }
                }
            })
        });

        let mut dispatcher_task = tokio::spawn(dispatcher::run(
            manifest.clone(),
            source_pool.clone() as Arc<dyn BatchSink>,
            dest_pool.clone() as Arc<dyn BatchSink>,
            source_errors,
            dest_errors,
            cancel.clone(),
            dispatcher::POLL_INTERVAL,
        ));
        let mut interrupted = false;
        let dispatch_result = tokio::select! {
            result = &mut dispatcher_task => flatten_join(result),
            _ = tokio::signal::ctrl_c() => {
                event!(Level::INFO, "interrupt received, shutting down gracefully");
                interrupted = true;
                cancel.cancel();
                flatten_join(dispatcher_task.await)
            }
        };

        // shutdown order: stop signal is out, workers finish their current
        // subprocess, then cleanup runs
        source_pool.stop().await;
        dest_pool.stop().await;
        if let Some(autosaver) = autosaver {
            let _ = autosaver.await;
        }

        let success = dispatch_result.is_ok() && !interrupted && manifest.all_completed();
        manifest.set_status(if success {
            ManifestStatus::Completed
        } else {
            ManifestStatus::Failed
        });

        if success && options.buffer.cleanup {
            if let Err(error) = buffer.cleanup(&manifest.id).await {
                event!(Level::WARN, "buffer cleanup failed: {:#}", error);
            }
        } else if !success && !options.buffer.keep_on_failure {
            if let Err(error) = buffer.cleanup(&manifest.id).await {
                event!(Level::WARN, "buffer cleanup failed: {:#}", error);
            }
        } else if !success {
            event!(
                Level::INFO,
                "buffer preserved for resume at {:?}",
                buffer.manifest_dir(&manifest.id)
            );
        }
        if options.checkpoint.enabled {
            if let Err(error) = manifest.save(&options.checkpoint.path).await {
                event!(Level::WARN, "final checkpoint save failed: {:#}", error);
            } else if !success {
                event!(
                    Level::INFO,
                    "checkpoint written to {:?}",
                    options.checkpoint.path
                );
            }
        }

        if interrupted {
            return Err(CategorizedError::new(
                ExitCode::UserCanceled,
                anyhow!("transfer interrupted by user"),
            )
            .into());
        }
        if let Err(error) = dispatch_result {
            return Err(CategorizedError::new(ExitCode::TransferFailed, error).into());
        }
        if !success {
            let failed = manifest.count_with_status(BatchStatus::Failed);
            return Err(CategorizedError::new(
                ExitCode::PartialTransfer,
                anyhow!("{} of {} batches failed", failed, manifest.batches.len()),
            )
            .into());
        }

        let duration = start.elapsed();
        // per-transfer numbers come from the manifest, in source bytes;
        // the global progress counters only drive the live display
        let (bytes_done, files_done) = manifest
            .batches
            .iter()
            .filter(|batch| batch.status() == BatchStatus::Completed)
            .fold((0u64, 0u64), |(bytes, files), batch| {
                (bytes + batch.source_size, files + batch.file_count as u64)
            });
        Ok(TransferResult {
            success: true,
            transfer_id: manifest.id.clone(),
            bytes_total: manifest.total_size,
            bytes_done,
            files_total: manifest.total_files,
            files_done,
            duration,
            average_speed: format_speed(bytes_done, duration),
            message: format!(
                "tar transfer completed: {} batches",
                manifest.batches.len()
            ),
            error: None,
        })
    }
}

fn flatten_join(result: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(result) => result,
        Err(join_error) => Err(anyhow!("dispatcher panicked: {}", join_error)),
    }
}

/// Reconcile a loaded manifest with the buffer on disk.
///
/// Completed batches stay completed. Buffered batches whose archive still
/// exists with the recorded size get their reservation re-claimed and will
/// be re-dispatched straight to the destination pool; anything else goes
/// back to pending. A batch that crashed between `buffered` and
/// `completed` may be extracted twice; extraction of identical archives
/// is idempotent.
async fn prepare_resume(manifest: &Manifest, buffer: &BufferManager) -> Result<()> {
    for batch in &manifest.batches {
        match batch.status() {
            BatchStatus::Completed => {}
            BatchStatus::Buffered => {
                let archive_ok = match batch.local_path() {
                    Some(path) => tokio::fs::metadata(&path)
                        .await
                        .map(|m| m.len() == batch.size())
                        .unwrap_or(false),
                    None => false,
                };
                if archive_ok {
                    if !buffer.reserve(batch.size()) {
                        return Err(CategorizedError::new(
                            ExitCode::Config,
                            anyhow!(
                                "buffer cap too small to re-admit buffered batch {} ({} bytes)",
                                batch.id,
                                batch.size()
                            ),
                        )
                        .into());
                    }
                } else {
                    event!(
                        Level::WARN,
                        "buffered batch {} lost its archive, re-running it",
                        batch.id
                    );
                    batch.reset();
                }
            }
            _ => batch.reset(),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test(tokio::test)]
    async fn resume_reclaims_buffered_archives() {
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = BufferManager::new(buffer_root.path().to_path_buf(), 10_000);
        let mut manifest = Manifest::new("/src", "/dst", 1024);
        manifest.push_batch(vec!["a".to_string()], 5);
        manifest.push_batch(vec!["b".to_string()], 5);
        manifest.push_batch(vec!["c".to_string()], 5);

        // batch 0: completed; batch 1: buffered with a live archive;
        // batch 2: was mid-download when the process died
        manifest.batches[0].set_status(BatchStatus::Downloading);
        manifest.batches[0].set_status(BatchStatus::Completed);
        buffer.ensure_batch_dir(&manifest.id).await.unwrap();
        let archive = buffer.batch_path(&manifest.id, 1);
        tokio::fs::write(&archive, b"12345").await.unwrap();
        manifest.batches[1].set_status(BatchStatus::Downloading);
        manifest.batches[1].set_buffered(archive, 5);
        manifest.batches[2].set_status(BatchStatus::Downloading);

        prepare_resume(&manifest, &buffer).await.unwrap();
        assert_eq!(manifest.batches[0].status(), BatchStatus::Completed);
        assert_eq!(manifest.batches[1].status(), BatchStatus::Buffered);
        assert_eq!(manifest.batches[2].status(), BatchStatus::Pending);
        assert_eq!(buffer.current(), 5);
    }

    #[test(tokio::test)]
    async fn resume_reruns_batches_with_missing_archives() {
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = BufferManager::new(buffer_root.path().to_path_buf(), 10_000);
        let mut manifest = Manifest::new("/src", "/dst", 1024);
        manifest.push_batch(vec!["a".to_string()], 5);
        manifest.batches[0].set_status(BatchStatus::Downloading);
        manifest.batches[0]
            .set_buffered(buffer.batch_path(&manifest.id, 0), 5);
        // archive never written to disk
        prepare_resume(&manifest, &buffer).await.unwrap();
        assert_eq!(manifest.batches[0].status(), BatchStatus::Pending);
        assert_eq!(buffer.current(), 0);
    }

    #[test(tokio::test)]
    async fn resume_rejects_archives_over_the_cap() {
        let buffer_root = tempfile::tempdir().unwrap();
        let buffer = BufferManager::new(buffer_root.path().to_path_buf(), 3);
        let mut manifest = Manifest::new("/src", "/dst", 1024);
        manifest.push_batch(vec!["a".to_string()], 5);
        buffer.ensure_batch_dir(&manifest.id).await.unwrap();
        let archive = buffer.batch_path(&manifest.id, 0);
        tokio::fs::write(&archive, b"12345").await.unwrap();
        manifest.batches[0].set_status(BatchStatus::Downloading);
        manifest.batches[0].set_buffered(archive, 5);
        let error = prepare_resume(&manifest, &buffer).await.unwrap_err();
        assert_eq!(common::errcode::exit_code_of(&error), ExitCode::Config);
    }
}
