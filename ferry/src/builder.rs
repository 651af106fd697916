//! Source enumeration and bin packing.
//!
//! Files are enumerated through the executor with a `find` that runs from
//! the source root, so every path comes back source-relative. The packer
//! is first-fit in enumeration order: concatenating the batches in id
//! order always reproduces the enumeration sequence.

use anyhow::{anyhow, Context, Result};
use tracing::{event, instrument, Level};

use crate::manifest::Manifest;
use crate::path::Location;
use common::{CategorizedError, ExitCode};
use exec::{shell_escape, Executor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
}

/// Parse `<size> <path>` lines as produced by
/// `find . -type f -printf '%s %p\n'`. Lines that do not parse are
/// silently skipped; leading `./` is stripped.
pub fn parse_listing(output: &str) -> Vec<FileEntry> {
    let mut files = Vec::new();
    for line in output.lines() {
        let Some((size, path)) = line.split_once(' ') else {
            continue;
        };
        let Ok(size) = size.parse::<u64>() else {
            continue;
        };
        let path = path.strip_prefix("./").unwrap_or(path);
        if path.is_empty() || path == "." {
            continue;
        }
        files.push(FileEntry {
            path: path.to_string(),
            size,
        });
    }
    files
}

/// First-fit bin packing preserving enumeration order. A file larger than
/// the budget gets a batch of its own; it is never split.
pub fn pack(files: &[FileEntry], chunk_budget: u64) -> Vec<(Vec<String>, u64)> {
    let mut batches = Vec::new();
    let mut current_files: Vec<String> = Vec::new();
    let mut current_size: u64 = 0;
    for file in files {
        if !current_files.is_empty() && current_size + file.size > chunk_budget {
            batches.push((std::mem::take(&mut current_files), current_size));
            current_size = 0;
        }
        current_files.push(file.path.clone());
        current_size += file.size;
    }
    if !current_files.is_empty() {
        batches.push((current_files, current_size));
    }
    batches
}

/// Enumerate the source and produce a manifest of size-bounded batches.
#[instrument(skip(executor))]
pub async fn build_manifest(
    executor: &Executor,
    source: &Location,
    source_spec: &str,
    destination_spec: &str,
    chunk_size: u64,
) -> Result<Manifest> {
    let files = enumerate_files(executor, &source.path).await?;
    event!(
        Level::INFO,
        "enumerated {} files at {}",
        files.len(),
        source_spec
    );
    let mut manifest = Manifest::new(source_spec, destination_spec, chunk_size);
    for (batch_files, batch_size) in pack(&files, chunk_size) {
        manifest.push_batch(batch_files, batch_size);
    }
    event!(
        Level::INFO,
        "manifest {}: {} files, {} batches, {} total",
        manifest.id,
        manifest.total_files,
        manifest.batches.len(),
        bytesize::ByteSize(manifest.total_size)
    );
    Ok(manifest)
}

async fn enumerate_files(executor: &Executor, root: &str) -> Result<Vec<FileEntry>> {
    // running from the source root keeps every reported path relative
    let cmd = format!(
        "cd {} && find . -type f -printf '%s %p\\n'",
        shell_escape(root)
    );
    let output = executor
        .run(&cmd)
        .await
        .with_context(|| format!("failed to enumerate files under {:?}", root))?;
    if !output.success() {
        return Err(CategorizedError::new(
            ExitCode::SourceMissing,
            anyhow!(
                "enumeration failed with exit code {}: {}",
                output.exit_code,
                output.stderr_utf8().trim()
            ),
        )
        .into());
    }
    Ok(parse_listing(&output.stdout_utf8()))
}
