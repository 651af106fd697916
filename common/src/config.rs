//! Configuration types for transfer behavior.
//!
//! Flags take precedence over environment variables; environment variables
//! (prefix `FERRY_`) are fallbacks only.

use serde::{Deserialize, Serialize};

/// Thresholds driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
    /// Files smaller than this are "small" (bytes).
    pub small_file_size: u64,
    /// Files larger than this are "large" (bytes).
    pub large_file_size: u64,
    /// More files than this is "many".
    pub many_files_count: u64,
    /// Fewer files than this is "few".
    pub few_files_count: u64,
    /// Percentage of small files that triggers the tar pipeline.
    pub small_file_percent: f64,
    /// Percentage of large files that triggers rsync.
    pub large_file_percent: f64,
    /// Maximum number of files to sample when analyzing a local tree.
    pub max_sample_size: u64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            small_file_size: 10 * 1024,
            large_file_size: 100 * 1024 * 1024,
            many_files_count: 1000,
            few_files_count: 10,
            small_file_percent: 80.0,
            large_file_percent: 50.0,
            max_sample_size: 10_000,
        }
    }
}

/// Settings for the batched tar pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Pre-archive byte budget for a single batch.
    pub chunk_size: u64,
    /// Number of parallel archive workers on the source side.
    pub source_workers: usize,
    /// Number of parallel extract workers on the destination side.
    pub dest_workers: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 50 * 1024 * 1024,
            source_workers: 4,
            dest_workers: 2,
        }
    }
}

/// Settings for the on-disk staging buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Buffer root directory.
    pub path: std::path::PathBuf,
    /// Maximum bytes the buffer may hold.
    pub max_size: u64,
    /// Delete the buffer after a successful transfer.
    pub cleanup: bool,
    /// Preserve the buffer after failure or interrupt, for resume.
    pub keep_on_failure: bool,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("ferry-buffer"),
            max_size: 100 * 1024 * 1024 * 1024,
            cleanup: true,
            keep_on_failure: true,
        }
    }
}

/// Checkpoint/manifest persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub enabled: bool,
    pub path: std::path::PathBuf,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: std::env::temp_dir().join("ferry-checkpoint.json"),
        }
    }
}

/// Authentication for one SSH endpoint.
///
/// With nothing set the system ssh tries the agent first, then the default
/// key files. A password switches command execution to the `sshpass`
/// helper, handing the secret over via the `SSHPASS` environment variable
/// so it never appears in process arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<std::path::PathBuf>,
    pub agent: bool,
}

impl AuthSettings {
    /// Fill the password from the given environment variable if not set.
    pub fn with_env_password(mut self, var: &str) -> Self {
        if self.password.is_none() {
            if let Ok(password) = std::env::var(var) {
                if !password.is_empty() {
                    self.password = Some(password);
                }
            }
        }
        self
    }
}

/// Environment fallbacks recognized by the CLI (prefix `FERRY_`).
#[derive(Debug, Clone, Default)]
pub struct EnvDefaults {
    pub source: Option<String>,
    pub dest: Option<String>,
    pub strategy: Option<String>,
    pub parallel: Option<usize>,
    pub compression: Option<String>,
    pub checkpoint: Option<bool>,
    pub dry_run: Option<bool>,
}

impl EnvDefaults {
    pub fn load() -> Self {
        Self {
            source: env_string("FERRY_SOURCE"),
            dest: env_string("FERRY_DEST"),
            strategy: env_string("FERRY_STRATEGY"),
            parallel: env_string("FERRY_PARALLEL").and_then(|v| v.parse().ok()),
            compression: env_string("FERRY_COMPRESSION"),
            checkpoint: env_string("FERRY_CHECKPOINT").map(|v| truthy(&v)),
            dry_run: env_string("FERRY_DRY_RUN").map(|v| truthy(&v)),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_defaults() {
        let t = ThresholdSettings::default();
        assert_eq!(t.small_file_size, 10 * 1024);
        assert_eq!(t.large_file_size, 100 * 1024 * 1024);
        assert_eq!(t.many_files_count, 1000);
        assert_eq!(t.few_files_count, 10);
        assert_eq!(t.max_sample_size, 10_000);
    }

    #[test]
    fn batch_defaults() {
        let b = BatchSettings::default();
        assert_eq!(b.chunk_size, 50 * 1024 * 1024);
        assert_eq!(b.source_workers, 4);
        assert_eq!(b.dest_workers, 2);
    }

    #[test]
    fn settings_tolerate_unknown_and_missing_fields() {
        let parsed: BufferSettings =
            serde_json::from_str(r#"{"cleanup": false, "some_future_field": 7}"#).unwrap();
        assert!(!parsed.cleanup);
        assert!(parsed.keep_on_failure);
    }

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "yes", "on"] {
            assert!(truthy(v));
        }
        for v in ["0", "false", "no", ""] {
            assert!(!truthy(v));
        }
    }
}
