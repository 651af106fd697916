//! Transfer strategies and their engines.
//!
//! The engines are a tagged variant with one uniform capability: run a
//! transfer. `auto` never reaches an engine; the orchestration layer
//! resolves it through the analyzer first. The rsync and rclone engines
//! are thin wrappers over the installed binaries; the proxy engine pipes
//! a single stream between two SSH endpoints; the tar engine is the
//! batched pipeline in [`crate::tar`].

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{event, instrument, Level};

use crate::analyzer::Protocol;
use crate::checkpoint::{default_checkpoint_dir, CheckpointManager, CheckpointState};
use crate::path::Location;
use crate::{TransferOptions, TransferResult};
use common::{CategorizedError, ExitCode};
use exec::{shell_escape, Executor, HostKeyPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Auto,
    Rsync,
    Rclone,
    Tar,
    Proxy,
}

impl std::str::FromStr for Strategy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Strategy::Auto),
            "rsync" => Ok(Strategy::Rsync),
            "rclone" => Ok(Strategy::Rclone),
            "tar" => Ok(Strategy::Tar),
            "proxy" => Ok(Strategy::Proxy),
            _ => Err(CategorizedError::new(
                ExitCode::InvalidStrategy,
                anyhow!("invalid strategy {:?}, must be one of: auto, rsync, rclone, tar, proxy", s),
            )
            .into()),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Auto => "auto",
            Strategy::Rsync => "rsync",
            Strategy::Rclone => "rclone",
            Strategy::Tar => "tar",
            Strategy::Proxy => "proxy",
        };
        write!(f, "{}", name)
    }
}

/// One resolved transfer: parsed endpoints plus the raw specs (kept
/// because trailing slashes are meaningful to rsync).
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: Location,
    pub destination: Location,
    pub source_spec: String,
    pub destination_spec: String,
    pub options: TransferOptions,
}

#[derive(Debug)]
pub enum Engine {
    Rsync(RsyncEngine),
    Rclone(RcloneEngine),
    Tar(crate::tar::TarEngine),
    Proxy(ProxyEngine),
}

impl Engine {
    /// Build the engine for a resolved strategy. `auto` must already have
    /// been resolved by the analyzer.
    pub fn for_strategy(strategy: Strategy) -> Result<Engine> {
        match strategy {
            Strategy::Rsync => Ok(Engine::Rsync(RsyncEngine)),
            Strategy::Rclone => Ok(Engine::Rclone(RcloneEngine)),
            Strategy::Tar => Ok(Engine::Tar(crate::tar::TarEngine)),
            Strategy::Proxy => Ok(Engine::Proxy(ProxyEngine)),
            Strategy::Auto => Err(CategorizedError::new(
                ExitCode::InvalidStrategy,
                anyhow!("auto strategy must be resolved before execution"),
            )
            .into()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Rsync(_) => "rsync",
            Engine::Rclone(_) => "rclone",
            Engine::Tar(_) => "tar",
            Engine::Proxy(_) => "proxy",
        }
    }

    pub fn supports_protocol(&self, protocol: Protocol) -> bool {
        match self {
            Engine::Rsync(_) | Engine::Tar(_) => {
                matches!(protocol, Protocol::Local | Protocol::Ssh)
            }
            Engine::Proxy(_) => protocol == Protocol::Ssh,
            Engine::Rclone(_) => true,
        }
    }

    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        match self {
            Engine::Rsync(engine) => engine.transfer(request).await,
            Engine::Rclone(engine) => engine.transfer(request).await,
            Engine::Tar(engine) => engine.transfer(request).await,
            Engine::Proxy(engine) => engine.transfer(request).await,
        }
    }
}

/// Build an executor for one endpoint, local or remote.
pub(crate) async fn executor_for(
    location: &Location,
    auth: &common::config::AuthSettings,
    password_env: &str,
    policy: HostKeyPolicy,
) -> Result<Executor> {
    let Some(host) = &location.host else {
        return Ok(Executor::local());
    };
    let auth = auth.clone().with_env_password(password_env);
    let ssh_auth = exec::SshAuth {
        password: auth.password,
        keyfile: auth.keyfile,
        agent: auth.agent,
    };
    Executor::connect(location.user.as_deref(), host, &ssh_auth, policy)
        .await
        .map_err(|error| CategorizedError::new(ExitCode::Network, error).into())
}

/// Check that a required external binary is on PATH.
async fn require_binary(name: &str) -> Result<()> {
    let status = tokio::process::Command::new("which")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .status()
        .await
        .with_context(|| format!("failed to look up {} in PATH", name))?;
    if !status.success() {
        return Err(CategorizedError::new(
            ExitCode::EngineMissing,
            anyhow!("{} not found in PATH", name),
        )
        .into());
    }
    Ok(())
}

pub(crate) fn format_speed(bytes: u64, duration: std::time::Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return "-".to_string();
    }
    format!("{}/s", bytesize::ByteSize((bytes as f64 / secs) as u64))
}

async fn save_wrapper_checkpoint(request: &TransferRequest, state: &CheckpointState) {
    if !request.options.checkpoint.enabled {
        return;
    }
    match CheckpointManager::new(default_checkpoint_dir()).await {
        Ok(manager) => {
            if let Err(error) = manager.save(state).await {
                event!(Level::WARN, "checkpoint save failed: {:#}", error);
            }
        }
        Err(error) => event!(Level::WARN, "checkpoint manager unavailable: {:#}", error),
    }
}

/// Thin wrapper over the installed `rsync`.
#[derive(Debug)]
pub struct RsyncEngine;

impl RsyncEngine {
    #[instrument(skip_all)]
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let start = std::time::Instant::now();
        if request.options.dry_run {
            return Ok(TransferResult::dry_run(
                "rsync",
                &request.source_spec,
                &request.destination_spec,
            ));
        }
        require_binary("rsync").await?;
        let mut state = CheckpointState::new(
            &crate::manifest::new_transfer_id(),
            &request.source_spec,
            &request.destination_spec,
            "rsync",
        );
        save_wrapper_checkpoint(request, &state).await;
        let output = tokio::process::Command::new("rsync")
            .arg("-az")
            .arg("--stats")
            .arg(&request.source_spec)
            .arg(&request.destination_spec)
            .output()
            .await
            .context("failed to spawn rsync")?;
        if !output.status.success() {
            return Err(CategorizedError::new(
                ExitCode::TransferFailed,
                anyhow!(
                    "rsync failed with exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )
            .into());
        }
        let stats = String::from_utf8_lossy(&output.stdout);
        let files_done = parse_stat_line(&stats, "files transferred:").unwrap_or(0);
        let bytes_done = parse_stat_line(&stats, "Total transferred file size:").unwrap_or(0);
        let duration = start.elapsed();
        state.bytes_done = bytes_done;
        state.files_done = files_done;
        save_wrapper_checkpoint(request, &state).await;
        Ok(TransferResult {
            success: true,
            transfer_id: state.transfer_id,
            bytes_total: bytes_done,
            bytes_done,
            files_total: files_done,
            files_done,
            duration,
            average_speed: format_speed(bytes_done, duration),
            message: "rsync transfer completed".to_string(),
            error: None,
        })
    }
}

/// Pull the first integer out of the `--stats` line containing `key`.
fn parse_stat_line(stats: &str, key: &str) -> Option<u64> {
    let line = stats.lines().find(|line| line.contains(key))?;
    let digits: String = line
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Thin wrapper over the installed `rclone`.
#[derive(Debug)]
pub struct RcloneEngine;

impl RcloneEngine {
    #[instrument(skip_all)]
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let start = std::time::Instant::now();
        if request.options.dry_run {
            return Ok(TransferResult::dry_run(
                "rclone",
                &request.source_spec,
                &request.destination_spec,
            ));
        }
        require_binary("rclone").await?;
        let state = CheckpointState::new(
            &crate::manifest::new_transfer_id(),
            &request.source_spec,
            &request.destination_spec,
            "rclone",
        );
        save_wrapper_checkpoint(request, &state).await;
        let mut command = tokio::process::Command::new("rclone");
        command
            .arg("copy")
            .arg(&request.source_spec)
            .arg(&request.destination_spec);
        if request.options.parallel > 0 {
            command
                .arg("--transfers")
                .arg(request.options.parallel.to_string());
        }
        let output = command.output().await.context("failed to spawn rclone")?;
        if !output.status.success() {
            return Err(CategorizedError::new(
                ExitCode::TransferFailed,
                anyhow!(
                    "rclone failed with exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )
            .into());
        }
        let duration = start.elapsed();
        save_wrapper_checkpoint(request, &state).await;
        Ok(TransferResult {
            success: true,
            transfer_id: state.transfer_id,
            bytes_total: 0,
            bytes_done: 0,
            files_total: 0,
            files_done: 0,
            duration,
            average_speed: "-".to_string(),
            message: "rclone transfer completed".to_string(),
            error: None,
        })
    }
}

/// Remote-to-remote single-stream proxy: `cat` on the source piped into
/// `cat >` on the destination through this host.
#[derive(Debug)]
pub struct ProxyEngine;

impl ProxyEngine {
    #[instrument(skip_all)]
    pub async fn transfer(&self, request: &TransferRequest) -> Result<TransferResult> {
        let start = std::time::Instant::now();
        if !request.source.is_remote() || !request.destination.is_remote() {
            return Err(CategorizedError::new(
                ExitCode::UnsupportedProtocol,
                anyhow!("proxy strategy requires SSH endpoints on both sides"),
            )
            .into());
        }
        if request.options.dry_run {
            return Ok(TransferResult::dry_run(
                "proxy",
                &request.source_spec,
                &request.destination_spec,
            ));
        }
        let policy = request.options.host_key_policy;
        let source_exec = executor_for(
            &request.source,
            &request.options.source_auth,
            "FERRY_SOURCE_PASSWORD",
            policy,
        )
        .await?;
        let dest_exec = executor_for(
            &request.destination,
            &request.options.dest_auth,
            "FERRY_DEST_PASSWORD",
            policy,
        )
        .await?;

        let size_output = source_exec
            .run(&format!("stat -c %s {}", shell_escape(&request.source.path)))
            .await?;
        if !size_output.success() {
            return Err(CategorizedError::new(
                ExitCode::SourceMissing,
                anyhow!(
                    "cannot stat source file: {}",
                    size_output.stderr_utf8().trim()
                ),
            )
            .into());
        }
        let bytes_total: u64 = size_output
            .stdout_utf8()
            .trim()
            .parse()
            .context("unexpected stat output")?;
        common::PROGRESS.set_totals(bytes_total, 1);

        let mut state = CheckpointState::new(
            &crate::manifest::new_transfer_id(),
            &request.source_spec,
            &request.destination_spec,
            "proxy",
        );
        state.bytes_total = bytes_total;
        state.files_total = 1;
        save_wrapper_checkpoint(request, &state).await;

        let mut source_stream = source_exec
            .stream_read(&format!("cat {}", shell_escape(&request.source.path)))
            .await?;
        let mut dest_stream = dest_exec
            .stream_write(&format!("cat > {}", shell_escape(&request.destination.path)))
            .await?;
        let mut reader = source_stream
            .take_stdout()
            .context("proxy source has no stdout")?;
        let mut writer = dest_stream
            .take_stdin()
            .context("proxy destination has no stdin")?;

        let mut buf = vec![0u8; 1024 * 1024];
        let mut bytes_done: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .context("failed reading from source stream")?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .context("failed writing to destination stream")?;
            bytes_done += n as u64;
            common::PROGRESS.bytes_done.add(n as u64);
        }
        writer
            .shutdown()
            .await
            .context("failed to close destination stream")?;
        drop(writer);
        drop(reader);
        source_stream.finish().await?;
        dest_stream.finish().await?;
        common::PROGRESS.files_done.inc();

        let duration = start.elapsed();
        state.bytes_done = bytes_done;
        state.files_done = 1;
        save_wrapper_checkpoint(request, &state).await;
        Ok(TransferResult {
            success: true,
            transfer_id: state.transfer_id,
            bytes_total,
            bytes_done,
            files_total: 1,
            files_done: 1,
            duration,
            average_speed: format_speed(bytes_done, duration),
            message: "proxy transfer completed".to_string(),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::errcode::exit_code_of;
    use test_log::test;

    #[test]
    fn strategy_parsing() {
        assert_eq!("auto".parse::<Strategy>().unwrap(), Strategy::Auto);
        assert_eq!("tar".parse::<Strategy>().unwrap(), Strategy::Tar);
        assert_eq!("proxy".parse::<Strategy>().unwrap(), Strategy::Proxy);
        let err = "scp".parse::<Strategy>().unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidStrategy);
    }

    #[test]
    fn strategy_display_round_trips() {
        for strategy in [
            Strategy::Auto,
            Strategy::Rsync,
            Strategy::Rclone,
            Strategy::Tar,
            Strategy::Proxy,
        ] {
            assert_eq!(strategy.to_string().parse::<Strategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn auto_cannot_be_executed() {
        let err = Engine::for_strategy(Strategy::Auto).unwrap_err();
        assert_eq!(exit_code_of(&err), ExitCode::InvalidStrategy);
    }

    #[test]
    fn protocol_support_matrix() {
        let tar = Engine::for_strategy(Strategy::Tar).unwrap();
        assert!(tar.supports_protocol(Protocol::Local));
        assert!(tar.supports_protocol(Protocol::Ssh));
        assert!(!tar.supports_protocol(Protocol::S3));
        let proxy = Engine::for_strategy(Strategy::Proxy).unwrap();
        assert!(!proxy.supports_protocol(Protocol::Local));
        let rclone = Engine::for_strategy(Strategy::Rclone).unwrap();
        assert!(rclone.supports_protocol(Protocol::S3));
    }

    #[test]
    fn stat_line_parsing() {
        let stats = "\
Number of files: 12 (reg: 10, dir: 2)
Number of regular files transferred: 10
Total file size: 1,234,567 bytes
Total transferred file size: 1,234,567 bytes
";
        assert_eq!(parse_stat_line(stats, "files transferred:"), Some(10));
        assert_eq!(
            parse_stat_line(stats, "Total transferred file size:"),
            Some(1_234_567)
        );
        assert_eq!(parse_stat_line(stats, "no such key"), None);
    }

    #[test]
    fn speed_formatting() {
        let speed = format_speed(10 * 1024 * 1024, std::time::Duration::from_secs(2));
        assert!(speed.ends_with("/s"), "{}", speed);
        assert_eq!(format_speed(100, std::time::Duration::ZERO), "-");
    }
}
