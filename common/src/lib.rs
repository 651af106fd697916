#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod errcode;
pub mod progress;
pub mod testutils;

pub use errcode::{Categorize, CategorizedError, ErrorCategory, ExitCode};
pub use progress::{ProgressSettings, ProgressType, TransferProgress};

use std::io::IsTerminal;

lazy_static! {
    /// Progress counters for the transfer performed by this process.
    pub static ref PROGRESS: progress::TransferProgress = progress::TransferProgress::new();
}

fn parse_delay(value: &str) -> anyhow::Result<std::time::Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return Ok(std::time::Duration::from_millis(ms.trim().parse()?));
    }
    if let Some(min) = value.strip_suffix("min") {
        return Ok(std::time::Duration::from_secs(
            min.trim().parse::<u64>()? * 60,
        ));
    }
    if let Some(s) = value.strip_suffix('s') {
        return Ok(std::time::Duration::from_secs(s.trim().parse()?));
    }
    anyhow::bail!("cannot parse duration: {:?} (use e.g. 200ms, 10s, 5min)", value)
}

fn resolve_progress_type(requested: ProgressType) -> ProgressType {
    match requested {
        ProgressType::Auto => {
            if std::io::stderr().is_terminal() {
                ProgressType::ProgressBar
            } else {
                ProgressType::TextUpdates
            }
        }
        other => other,
    }
}

fn run_progress_loop(
    settings: ProgressSettings,
    done: std::sync::Arc<std::sync::atomic::AtomicBool>,
) -> anyhow::Result<()> {
    let progress_type = resolve_progress_type(settings.progress_type);
    let delay = match &settings.progress_delay {
        Some(value) => parse_delay(value)?,
        None => match progress_type {
            ProgressType::ProgressBar => std::time::Duration::from_millis(200),
            _ => std::time::Duration::from_secs(10),
        },
    };
    match progress_type {
        ProgressType::TextUpdates | ProgressType::Auto => loop {
            if done.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok(());
            }
            let snap = PROGRESS.snapshot();
            tracing::info!(
                "progress: {}/{} files, {}/{}, {} batches buffered, {} done",
                snap.files_done,
                snap.files_total,
                bytesize::ByteSize(snap.bytes_done),
                bytesize::ByteSize(snap.bytes_total),
                snap.batches_buffered,
                snap.batches_finished,
            );
            std::thread::sleep(delay);
        },
        ProgressType::ProgressBar => {
            let pbar = indicatif::ProgressBar::new(0);
            pbar.set_style(
                indicatif::ProgressStyle::with_template(
                    "{bar:40} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )
                .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
            );
            loop {
                if done.load(std::sync::atomic::Ordering::SeqCst) {
                    pbar.finish_and_clear();
                    return Ok(());
                }
                let snap = PROGRESS.snapshot();
                pbar.set_length(snap.bytes_total.max(snap.bytes_done));
                pbar.set_position(snap.bytes_done);
                pbar.set_message(format!(
                    "{}/{} files",
                    snap.files_done,
                    snap.files_total.max(snap.files_done)
                ));
                std::thread::sleep(delay);
            }
        }
    }
}

/// Process entry wrapper.
///
/// Sets up the tracing subscriber from the verbosity level, builds the
/// tokio runtime, optionally spawns the progress reporter thread and runs
/// the async entry point. Errors are logged here (unless quiet) and
/// returned so the caller can map them to an exit code.
pub fn run<Fut, Summary>(
    progress_settings: Option<ProgressSettings>,
    quiet: bool,
    verbose: u8,
    max_workers: usize,
    func: impl FnOnce() -> Fut,
) -> anyhow::Result<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if max_workers > 0 {
        runtime_builder.worker_threads(max_workers);
    }
    let runtime = runtime_builder
        .build()
        .map_err(|error| anyhow::anyhow!("failed to build tokio runtime: {}", error))?;
    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let pbar_thread = progress_settings.map(|settings| {
        let done = done.clone();
        std::thread::spawn(move || {
            if let Err(error) = run_progress_loop(settings, done) {
                tracing::error!("progress reporter failed: {:#}", error);
            }
        })
    });
    let result = runtime.block_on(func());
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(thread) = pbar_thread {
        let _ = thread.join();
    }
    if let Err(error) = &result {
        if !quiet {
            tracing::error!("{:#}", error);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_parsing() {
        assert_eq!(
            parse_delay("200ms").unwrap(),
            std::time::Duration::from_millis(200)
        );
        assert_eq!(parse_delay("10s").unwrap(), std::time::Duration::from_secs(10));
        assert_eq!(
            parse_delay("5min").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert!(parse_delay("fast").is_err());
    }
}
