/// Monotonic event counter shared between the worker pools and the
/// reporter thread.
///
/// A transfer runs a handful of workers (4 archivers and 2 extractors by
/// default), and each bumps a counter once per batch or per stream chunk.
/// At that rate a single relaxed atomic is uncontended; readers only ever
/// need an eventually-consistent total.
pub struct Counter(std::sync::atomic::AtomicU64);

impl Counter {
    #[must_use]
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Counter").field(&self.get()).finish()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Started/finished pair for units of work that have a lifetime.
///
/// The two sides are bumped by different pools, so a reader can
/// transiently observe finished ahead of started; `get` clamps that.
#[derive(Debug, Default)]
pub struct WorkCounter {
    pub started: Counter,
    pub finished: Counter,
}

pub struct WorkStatus {
    pub started: u64,
    pub finished: u64,
}

impl WorkCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Counter::new(),
            finished: Counter::new(),
        }
    }

    pub fn get(&self) -> WorkStatus {
        let mut status = WorkStatus {
            started: self.started.get(),
            finished: self.finished.get(),
        };
        if status.finished > status.started {
            status.started = status.finished;
        }
        status
    }
}

/// Live counters for one transfer.
///
/// The worker pools bump these; the reporter thread and the final summary
/// read them. Totals are published by the planner once the manifest (or the
/// analysis) is known.
pub struct TransferProgress {
    pub batches: WorkCounter,
    pub batches_buffered: Counter,
    pub batches_failed: Counter,
    pub files_done: Counter,
    pub bytes_archived: Counter,
    pub bytes_done: Counter,
    bytes_total: std::sync::atomic::AtomicU64,
    files_total: std::sync::atomic::AtomicU64,
    start_time: std::time::Instant,
}

impl TransferProgress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            batches: WorkCounter::new(),
            batches_buffered: Counter::new(),
            batches_failed: Counter::new(),
            files_done: Counter::new(),
            bytes_archived: Counter::new(),
            bytes_done: Counter::new(),
            bytes_total: std::sync::atomic::AtomicU64::new(0),
            files_total: std::sync::atomic::AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn set_totals(&self, bytes: u64, files: u64) {
        self.bytes_total
            .store(bytes, std::sync::atomic::Ordering::Relaxed);
        self.files_total
            .store(files, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn files_total(&self) -> u64 {
        self.files_total.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let batches = self.batches.get();
        ProgressSnapshot {
            batches_started: batches.started,
            batches_finished: batches.finished,
            batches_buffered: self.batches_buffered.get(),
            batches_failed: self.batches_failed.get(),
            files_done: self.files_done.get(),
            files_total: self.files_total(),
            bytes_archived: self.bytes_archived.get(),
            bytes_done: self.bytes_done.get(),
            bytes_total: self.bytes_total(),
            current_time: std::time::SystemTime::now(),
        }
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`TransferProgress`], suitable for serialization.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ProgressSnapshot {
    pub batches_started: u64,
    pub batches_finished: u64,
    pub batches_buffered: u64,
    pub batches_failed: u64,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_archived: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub current_time: std::time::SystemTime,
}

/// How progress is rendered while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressType {
    /// Animated progress bar, for interactive terminals.
    ProgressBar,
    /// Periodic log lines, for non-interactive output.
    TextUpdates,
    /// Pick based on whether stderr is a terminal.
    #[default]
    Auto,
}

impl std::str::FromStr for ProgressType {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ProgressBar" => Ok(ProgressType::ProgressBar),
            "TextUpdates" => Ok(ProgressType::TextUpdates),
            "Auto" => Ok(ProgressType::Auto),
            _ => Err(anyhow::anyhow!(
                "invalid progress type: {:?}, must be one of: ProgressBar, TextUpdates, Auto",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    pub progress_delay: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_across_threads() {
        let counter = std::sync::Arc::new(Counter::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.inc();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn work_counter_clamps_inversion() {
        let work = WorkCounter::new();
        work.finished.inc();
        let status = work.get();
        assert_eq!(status.started, status.finished);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let progress = TransferProgress::new();
        progress.set_totals(1000, 10);
        progress.bytes_done.add(250);
        progress.files_done.add(3);
        let snap = progress.snapshot();
        assert_eq!(snap.bytes_total, 1000);
        assert_eq!(snap.bytes_done, 250);
        assert_eq!(snap.files_done, 3);
    }
}
