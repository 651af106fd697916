//! `ferry` moves large file trees between local and SSH-accessible
//! endpoints, picking among several transfer engines based on what the
//! data looks like: rsync for few/large files, rclone for cloud backends,
//! a streaming proxy for remote-to-remote single files, and a batched,
//! disk-buffered tar pipeline for large collections of small files.

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{event, instrument, Level};

pub mod analyzer;
pub mod buffer;
pub mod builder;
pub mod checkpoint;
pub mod destination;
pub mod dispatcher;
pub mod engine;
pub mod manifest;
pub mod path;
pub mod source;
pub mod tar;

pub use analyzer::{Analysis, Analyzer};
pub use engine::{Engine, Strategy, TransferRequest};
pub use path::Location;

use common::config::{
    AuthSettings, BatchSettings, BufferSettings, CheckpointSettings, ThresholdSettings,
};
use common::{CategorizedError, ExitCode};
use exec::HostKeyPolicy;

/// Everything a transfer can be configured with. Field groups mirror the
/// settings types in `common::config`.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub strategy: Strategy,
    pub batch: BatchSettings,
    pub buffer: BufferSettings,
    pub checkpoint: CheckpointSettings,
    pub thresholds: ThresholdSettings,
    pub source_auth: AuthSettings,
    pub dest_auth: AuthSettings,
    pub host_key_policy: HostKeyPolicy,
    /// Parallelism hint for engines that take one (rclone --transfers).
    pub parallel: usize,
    pub dry_run: bool,
    /// Resume a tar transfer from this manifest checkpoint.
    pub resume: Option<std::path::PathBuf>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::Auto,
            batch: Default::default(),
            buffer: Default::default(),
            checkpoint: Default::default(),
            thresholds: Default::default(),
            source_auth: Default::default(),
            dest_auth: Default::default(),
            host_key_policy: Default::default(),
            parallel: 4,
            dry_run: false,
            resume: None,
        }
    }
}

/// Outcome of a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferResult {
    pub success: bool,
    pub transfer_id: String,
    pub bytes_total: u64,
    pub bytes_done: u64,
    pub files_total: u64,
    pub files_done: u64,
    pub duration: std::time::Duration,
    pub average_speed: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferResult {
    pub(crate) fn dry_run(engine: &str, source: &str, destination: &str) -> Self {
        Self {
            success: true,
            transfer_id: manifest::new_transfer_id(),
            bytes_total: 0,
            bytes_done: 0,
            files_total: 0,
            files_done: 0,
            duration: std::time::Duration::ZERO,
            average_speed: "-".to_string(),
            message: format!(
                "dry run: {} would transfer {} -> {}",
                engine, source, destination
            ),
            error: None,
        }
    }
}

impl std::fmt::Display for TransferResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({})", self.message, self.transfer_id)?;
        writeln!(
            f,
            "files: {}/{}",
            self.files_done,
            self.files_total.max(self.files_done)
        )?;
        writeln!(
            f,
            "bytes: {}/{}",
            bytesize::ByteSize(self.bytes_done),
            bytesize::ByteSize(self.bytes_total.max(self.bytes_done))
        )?;
        write!(
            f,
            "duration: {:.1?}, average speed: {}",
            self.duration, self.average_speed
        )
    }
}

/// Planning-only view of a transfer.
#[derive(Debug, Clone, Serialize)]
pub struct Estimate {
    pub bytes_total: u64,
    pub files_total: u64,
    pub estimated_time: std::time::Duration,
    pub estimated_speed: String,
    pub recommendation: Strategy,
    pub reason: String,
}

/// Nominal planning throughput used by [`estimate`].
const PLANNING_SPEED: u64 = 100 * 1024 * 1024;

/// Run a full transfer from `source` to `destination`.
#[instrument(skip(options))]
pub async fn transfer(
    source: &str,
    destination: &str,
    options: TransferOptions,
) -> Result<TransferResult> {
    let source_location = Location::parse(source)?;
    let destination_location = Location::parse(destination)?;
    let strategy = resolve_strategy(source, destination, &options).await?;
    let engine = Engine::for_strategy(strategy)?;
    for (spec, role) in [(source, "source"), (destination, "destination")] {
        let protocol = analyzer::detect_protocol(spec);
        if !engine.supports_protocol(protocol) {
            return Err(CategorizedError::new(
                ExitCode::UnsupportedProtocol,
                anyhow!(
                    "{} engine does not support {:?} {} ({:?})",
                    engine.name(),
                    protocol,
                    role,
                    spec
                ),
            )
            .into());
        }
    }
    event!(
        Level::INFO,
        "transferring {} -> {} using {}",
        source,
        destination,
        engine.name()
    );
    let request = TransferRequest {
        source: source_location,
        destination: destination_location,
        source_spec: source.to_string(),
        destination_spec: destination.to_string(),
        options,
    };
    engine.transfer(&request).await
}

async fn resolve_strategy(
    source: &str,
    destination: &str,
    options: &TransferOptions,
) -> Result<Strategy> {
    if options.strategy != Strategy::Auto {
        return Ok(options.strategy);
    }
    let analysis = Analyzer::new(options.thresholds)
        .analyze_transfer(source, destination)
        .await?;
    event!(
        Level::INFO,
        "auto strategy resolved to {}: {}",
        analysis.recommendation,
        analysis.reason
    );
    Ok(analysis.recommendation)
}

/// Analyze a source without transferring anything.
pub async fn analyze(source: &str, thresholds: ThresholdSettings) -> Result<Analysis> {
    Analyzer::new(thresholds).analyze(source).await
}

/// Estimate a transfer without performing it. Never modifies the source.
pub async fn estimate(
    source: &str,
    destination: &str,
    options: &TransferOptions,
) -> Result<Estimate> {
    let analysis = Analyzer::new(options.thresholds)
        .analyze_transfer(source, destination)
        .await?;
    let recommendation = if options.strategy == Strategy::Auto {
        analysis.recommendation
    } else {
        options.strategy
    };
    let estimated_time =
        std::time::Duration::from_secs_f64(analysis.total_size as f64 / PLANNING_SPEED as f64);
    Ok(Estimate {
        bytes_total: analysis.total_size,
        files_total: analysis.total_files,
        estimated_time,
        estimated_speed: format!("~{}/s", bytesize::ByteSize(PLANNING_SPEED)),
        recommendation,
        reason: analysis.reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::errcode::exit_code_of;
    use common::testutils;
    use test_log::test;

    #[test(tokio::test)]
    async fn invalid_locations_are_config_errors() {
        let err = transfer(":bad", "/dst", TransferOptions::default())
            .await
            .unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::Config);
    }

    #[test(tokio::test)]
    async fn proxy_rejects_local_endpoints() {
        let options = TransferOptions {
            strategy: Strategy::Proxy,
            ..Default::default()
        };
        let err = transfer("/src", "/dst", options).await.unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::UnsupportedProtocol);
    }

    #[test(tokio::test)]
    async fn tar_rejects_cloud_endpoints() {
        let options = TransferOptions {
            strategy: Strategy::Tar,
            ..Default::default()
        };
        let err = transfer("/src", "s3://bucket/prefix", options)
            .await
            .unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::UnsupportedProtocol);
    }

    #[test(tokio::test)]
    async fn estimate_does_not_touch_the_source() {
        let tmp_dir = tempfile::tempdir().unwrap();
        testutils::write_tree(tmp_dir.path(), &[("a.txt", 100), ("b.txt", 200)])
            .await
            .unwrap();
        let before: Vec<_> = std::fs::read_dir(tmp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        let estimate = estimate(
            tmp_dir.path().to_str().unwrap(),
            "/dst",
            &TransferOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(estimate.files_total, 2);
        assert_eq!(estimate.bytes_total, 300);
        assert_eq!(estimate.recommendation, Strategy::Rsync);
        let after: Vec<_> = std::fs::read_dir(tmp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(before, after);
    }
}
