//! Source tree analysis and strategy selection.
//!
//! Local sources are walked (with deterministic down-sampling above
//! `max_sample_size`) and classified into size buckets; remote sources get
//! a coarse analysis. The recommendation rules run in a fixed order and
//! every recommendation carries a reason citing the observed counts.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{event, instrument, Level};

use crate::engine::Strategy;
use common::config::ThresholdSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Local,
    Ssh,
    S3,
    Gcs,
    Azure,
    Http,
    Ftp,
}

pub fn detect_protocol(spec: &str) -> Protocol {
    if spec.starts_with("s3://") {
        Protocol::S3
    } else if spec.starts_with("gs://") || spec.starts_with("gcs://") {
        Protocol::Gcs
    } else if spec.starts_with("azure://") || spec.starts_with("wasb://") {
        Protocol::Azure
    } else if spec.starts_with("http://") || spec.starts_with("https://") {
        Protocol::Http
    } else if spec.starts_with("ftp://") || spec.starts_with("ftps://") {
        Protocol::Ftp
    } else if !spec.starts_with('/') && spec.contains(':') {
        Protocol::Ssh
    } else {
        Protocol::Local
    }
}

/// Result of analyzing a source (and optionally a destination).
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub total_files: u64,
    pub total_size: u64,
    pub average_file_size: u64,
    pub small_files: u64,
    pub medium_files: u64,
    pub large_files: u64,
    pub file_types: std::collections::BTreeMap<String, u64>,
    pub source_protocol: Protocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_protocol: Option<Protocol>,
    /// True when the counts are scaled estimates from a sampled walk.
    pub sampled: bool,
    pub recommendation: Strategy,
    pub reason: String,
}

impl Analysis {
    fn empty(source_protocol: Protocol) -> Self {
        Self {
            total_files: 0,
            total_size: 0,
            average_file_size: 0,
            small_files: 0,
            medium_files: 0,
            large_files: 0,
            file_types: Default::default(),
            source_protocol,
            dest_protocol: None,
            sampled: false,
            recommendation: Strategy::Rclone,
            reason: String::new(),
        }
    }
}

pub struct Analyzer {
    thresholds: ThresholdSettings,
}

impl Analyzer {
    pub fn new(thresholds: ThresholdSettings) -> Self {
        Self { thresholds }
    }

    /// Analyze a source spec on its own (rules 2-6).
    #[instrument(skip(self))]
    pub async fn analyze(&self, source: &str) -> Result<Analysis> {
        let protocol = detect_protocol(source);
        if protocol != Protocol::Local {
            let mut analysis = Analysis::empty(protocol);
            analysis.recommendation = Strategy::Rclone;
            analysis.reason =
                "rclone recommended: remote source with unknown contents, broad backend support"
                    .to_string();
            return Ok(analysis);
        }
        let mut analysis = self.analyze_local(std::path::Path::new(source)).await?;
        let (recommendation, reason) = self.recommend(&analysis);
        analysis.recommendation = recommendation;
        analysis.reason = reason;
        Ok(analysis)
    }

    /// Analyze a source/destination pair; remote-to-remote SSH short
    /// circuits to the streaming proxy (rule 1).
    #[instrument(skip(self))]
    pub async fn analyze_transfer(&self, source: &str, destination: &str) -> Result<Analysis> {
        let source_protocol = detect_protocol(source);
        let dest_protocol = detect_protocol(destination);
        if source_protocol == Protocol::Ssh && dest_protocol == Protocol::Ssh {
            let mut analysis = Analysis::empty(source_protocol);
            analysis.dest_protocol = Some(dest_protocol);
            analysis.recommendation = Strategy::Proxy;
            analysis.reason =
                "proxy recommended: remote-to-remote streaming over SSH".to_string();
            return Ok(analysis);
        }
        let mut analysis = self.analyze(source).await?;
        analysis.dest_protocol = Some(dest_protocol);
        Ok(analysis)
    }

    async fn analyze_local(&self, root: &std::path::Path) -> Result<Analysis> {
        let root = root.to_path_buf();
        let thresholds = self.thresholds;
        tokio::task::spawn_blocking(move || analyze_local_sync(&root, &thresholds))
            .await
            .context("analyzer task panicked")?
    }

    fn recommend(&self, analysis: &Analysis) -> (Strategy, String) {
        let t = &self.thresholds;
        let total = analysis.total_files;
        if total < t.few_files_count {
            return (
                Strategy::Rsync,
                format!("rsync recommended: only {} files to transfer", total),
            );
        }
        let small_pct = analysis.small_files as f64 / total as f64 * 100.0;
        if total > t.many_files_count && small_pct > t.small_file_percent {
            return (
                Strategy::Tar,
                format!(
                    "tar pipeline recommended: {} files, ~{:.0}% small (<{} KiB)",
                    total,
                    small_pct,
                    t.small_file_size / 1024
                ),
            );
        }
        let large_pct = analysis.large_files as f64 / total as f64 * 100.0;
        if large_pct > t.large_file_percent {
            return (
                Strategy::Rsync,
                format!(
                    "rsync recommended: ~{:.1}% are large files (>{} MiB)",
                    large_pct,
                    t.large_file_size / (1024 * 1024)
                ),
            );
        }
        (
            Strategy::Rclone,
            format!(
                "rclone recommended: mixed workload with {} files, average size {}",
                total,
                bytesize::ByteSize(analysis.average_file_size)
            ),
        )
    }
}

/// Depth-first walk with entries sorted by name, so repeated runs over an
/// unchanged tree visit files in the same order and sampling stays
/// deterministic. Unreadable entries are skipped.
fn walk_sorted(dir: &std::path::Path, visit: &mut dyn FnMut(&std::path::Path, u64)) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        if metadata.is_dir() {
            walk_sorted(&path, visit);
        } else {
            visit(&path, metadata.len());
        }
    }
}

fn analyze_local_sync(root: &std::path::Path, thresholds: &ThresholdSettings) -> Result<Analysis> {
    if !root.exists() {
        anyhow::bail!("source path {:?} does not exist", root);
    }
    // first pass: total count, to derive the sampling interval
    let mut file_count: u64 = 0;
    walk_sorted(root, &mut |_, _| file_count += 1);
    let interval = if file_count > thresholds.max_sample_size {
        file_count.div_ceil(thresholds.max_sample_size)
    } else {
        1
    };
    if interval > 1 {
        event!(
            Level::DEBUG,
            "sampling every {}-th of {} files",
            interval,
            file_count
        );
    }
    let mut analysis = Analysis::empty(Protocol::Local);
    analysis.sampled = interval > 1;
    let mut index: u64 = 0;
    walk_sorted(root, &mut |path, size| {
        index += 1;
        if index % interval != 0 {
            return;
        }
        analysis.total_files += interval;
        analysis.total_size += size * interval;
        if size < thresholds.small_file_size {
            analysis.small_files += interval;
        } else if size > thresholds.large_file_size {
            analysis.large_files += interval;
        } else {
            analysis.medium_files += interval;
        }
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
            .unwrap_or_else(|| "(no extension)".to_string());
        *analysis.file_types.entry(ext).or_insert(0) += interval;
    });
    if analysis.total_files > 0 {
        analysis.average_file_size = analysis.total_size / analysis.total_files;
    }
    Ok(analysis)
}
