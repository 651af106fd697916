use anyhow::{anyhow, Result};
use structopt::StructOpt;
use tracing::{event, Level};

use common::config::{EnvDefaults, ThresholdSettings};
use common::errcode::exit_code_of;
use common::{CategorizedError, ExitCode, ProgressType};
use ferry::{Strategy, TransferOptions};

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "ferry",
    about = "`ferry` moves large file trees between local and SSH-accessible endpoints. It picks \
    among several engines based on the data: rsync for few or large files, rclone for cloud \
    backends, a streaming proxy for remote-to-remote single files, and a batched disk-buffered \
    tar pipeline for large collections of small files."
)]
struct Args {
    /// Verbose level (-v INFO / -vv DEBUG / -vvv TRACE, default: ERROR)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences), global = true)]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[structopt(short = "q", long = "quiet", global = true)]
    quiet: bool,

    /// Show progress
    #[structopt(long, global = true)]
    progress: bool,

    /// Toggles the type of progress to show.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: ProgressBar (animated progress bar), TextUpdates (appropriate for logging),
    /// Auto (default, will choose based on the type of terminal attached to stderr)
    #[structopt(long, global = true)]
    progress_type: Option<ProgressType>,

    /// Sets the delay between progress updates, e.g. "200ms", "10s".
    ///
    /// If specified, --progress flag is implied.
    #[structopt(long, global = true)]
    progress_delay: Option<String>,

    /// Print results as JSON
    #[structopt(long, global = true)]
    json: bool,

    /// Number of worker threads, 0 means number of cores
    #[structopt(long, default_value = "0", global = true)]
    max_workers: usize,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt, Debug, Clone)]
enum Command {
    /// Transfer data from source to destination
    Transfer(TransferArgs),
    /// Analyze a source and recommend a strategy without transferring
    Analyze(AnalyzeArgs),
    /// Estimate a transfer without performing it
    Estimate(TransferArgs),
}

#[derive(StructOpt, Debug, Clone)]
struct TransferArgs {
    /// Source path or spec: path, host:path or user@host:path
    /// (falls back to FERRY_SOURCE)
    source: Option<String>,

    /// Destination path or spec (falls back to FERRY_DEST)
    destination: Option<String>,

    /// Transfer strategy: auto, rsync, rclone, tar, proxy
    /// (falls back to FERRY_STRATEGY)
    #[structopt(short, long)]
    strategy: Option<Strategy>,

    /// Per-batch size budget for the tar pipeline
    #[structopt(long, default_value = "50MiB")]
    chunk_size: bytesize::ByteSize,

    /// Number of parallel archive workers on the source side
    #[structopt(long, default_value = "4")]
    source_workers: usize,

    /// Number of parallel extract workers on the destination side
    #[structopt(long, default_value = "2")]
    dest_workers: usize,

    /// Buffer root directory (default: a ferry-buffer directory under the
    /// system temp dir)
    #[structopt(long)]
    buffer_path: Option<std::path::PathBuf>,

    /// Maximum bytes the buffer may hold
    #[structopt(long, default_value = "100GiB")]
    buffer_max_size: bytesize::ByteSize,

    /// Keep the buffer after a successful transfer
    #[structopt(long)]
    no_buffer_cleanup: bool,

    /// Remove the buffer even after failure or interrupt (loses resume)
    #[structopt(long)]
    discard_buffer_on_failure: bool,

    /// Disable manifest checkpointing (falls back to FERRY_CHECKPOINT)
    #[structopt(long)]
    no_checkpoint: bool,

    /// Where to write the manifest/checkpoint document
    #[structopt(long)]
    checkpoint_path: Option<std::path::PathBuf>,

    /// Resume a tar transfer from a manifest checkpoint
    #[structopt(long)]
    resume: Option<std::path::PathBuf>,

    /// Plan the transfer but do not move any data
    /// (falls back to FERRY_DRY_RUN)
    #[structopt(long)]
    dry_run: bool,

    /// Parallel transfers hint for engines that take one
    /// (falls back to FERRY_PARALLEL)
    #[structopt(long)]
    parallel: Option<usize>,

    /// SSH identity file for both endpoints
    #[structopt(long)]
    ssh_key: Option<std::path::PathBuf>,

    /// Require hosts to be present in known_hosts
    #[structopt(long)]
    strict_host_keys: bool,

    #[structopt(flatten)]
    thresholds: ThresholdArgs,
}

#[derive(StructOpt, Debug, Clone)]
struct AnalyzeArgs {
    /// Source path or spec (falls back to FERRY_SOURCE)
    source: Option<String>,

    #[structopt(flatten)]
    thresholds: ThresholdArgs,
}

#[derive(StructOpt, Debug, Clone)]
struct ThresholdArgs {
    /// Files smaller than this many KiB are "small"
    #[structopt(long)]
    small_file_kb: Option<u64>,

    /// Files larger than this many MiB are "large"
    #[structopt(long)]
    large_file_mb: Option<u64>,

    /// More files than this is "many"
    #[structopt(long)]
    many_files: Option<u64>,

    /// Fewer files than this is "few"
    #[structopt(long)]
    few_files: Option<u64>,

    /// Percentage of small files that triggers the tar pipeline
    #[structopt(long)]
    small_file_percent: Option<f64>,

    /// Percentage of large files that triggers rsync
    #[structopt(long)]
    large_file_percent: Option<f64>,

    /// Maximum number of files to sample when analyzing a local tree
    #[structopt(long)]
    max_sample_size: Option<u64>,
}

impl ThresholdArgs {
    fn apply(&self, mut thresholds: ThresholdSettings) -> ThresholdSettings {
        if let Some(kb) = self.small_file_kb {
            thresholds.small_file_size = kb * 1024;
        }
        if let Some(mb) = self.large_file_mb {
            thresholds.large_file_size = mb * 1024 * 1024;
        }
        if let Some(count) = self.many_files {
            thresholds.many_files_count = count;
        }
        if let Some(count) = self.few_files {
            thresholds.few_files_count = count;
        }
        if let Some(percent) = self.small_file_percent {
            thresholds.small_file_percent = percent;
        }
        if let Some(percent) = self.large_file_percent {
            thresholds.large_file_percent = percent;
        }
        if let Some(size) = self.max_sample_size {
            thresholds.max_sample_size = size;
        }
        thresholds
    }
}

fn require_spec(explicit: Option<String>, fallback: Option<String>, what: &str) -> Result<String> {
    explicit.or(fallback).ok_or_else(|| {
        CategorizedError::new(
            ExitCode::Config,
            anyhow!("no {} specified (pass it as an argument or set the environment fallback)", what),
        )
        .into()
    })
}

fn build_options(args: &TransferArgs, env: &EnvDefaults) -> Result<TransferOptions> {
    let strategy = match (&args.strategy, &env.strategy) {
        (Some(strategy), _) => *strategy,
        (None, Some(value)) => value.parse()?,
        (None, None) => Strategy::Auto,
    };
    if let Some(compression) = &env.compression {
        if compression != "auto" && compression != "gzip" {
            event!(
                Level::WARN,
                "FERRY_COMPRESSION={} is not supported, the tar pipeline always uses gzip",
                compression
            );
        }
    }
    let mut options = TransferOptions {
        strategy,
        parallel: args.parallel.or(env.parallel).unwrap_or(4),
        dry_run: args.dry_run || env.dry_run.unwrap_or(false),
        resume: args.resume.clone(),
        thresholds: args.thresholds.apply(ThresholdSettings::default()),
        ..Default::default()
    };
    options.batch.chunk_size = args.chunk_size.0;
    options.batch.source_workers = args.source_workers;
    options.batch.dest_workers = args.dest_workers;
    if let Some(path) = &args.buffer_path {
        options.buffer.path = path.clone();
    }
    options.buffer.max_size = args.buffer_max_size.0;
    options.buffer.cleanup = !args.no_buffer_cleanup;
    options.buffer.keep_on_failure = !args.discard_buffer_on_failure;
    options.checkpoint.enabled = !args.no_checkpoint && env.checkpoint.unwrap_or(true);
    if let Some(path) = &args.checkpoint_path {
        options.checkpoint.path = path.clone();
    }
    if args.strict_host_keys {
        options.host_key_policy = exec::HostKeyPolicy::Strict;
    }
    options.source_auth.keyfile = args.ssh_key.clone();
    options.dest_auth.keyfile = args.ssh_key.clone();
    Ok(options)
}

async fn run_command(command: Command, env: EnvDefaults, json: bool) -> Result<String> {
    match command {
        Command::Transfer(args) => {
            let source = require_spec(args.source.clone(), env.source.clone(), "source")?;
            let destination =
                require_spec(args.destination.clone(), env.dest.clone(), "destination")?;
            let options = build_options(&args, &env)?;
            let result = ferry::transfer(&source, &destination, options).await?;
            if json {
                Ok(serde_json::to_string_pretty(&result)?)
            } else {
                Ok(result.to_string())
            }
        }
        Command::Analyze(args) => {
            let source = require_spec(args.source.clone(), env.source.clone(), "source")?;
            let thresholds = args.thresholds.apply(ThresholdSettings::default());
            let analysis = ferry::analyze(&source, thresholds).await?;
            if json {
                Ok(serde_json::to_string_pretty(&analysis)?)
            } else {
                Ok(format!(
                    "files: {} ({} small / {} medium / {} large){}\n\
                     total size: {}\n\
                     recommendation: {}\n\
                     reason: {}",
                    analysis.total_files,
                    analysis.small_files,
                    analysis.medium_files,
                    analysis.large_files,
                    if analysis.sampled { " [estimated]" } else { "" },
                    bytesize::ByteSize(analysis.total_size),
                    analysis.recommendation,
                    analysis.reason
                ))
            }
        }
        Command::Estimate(args) => {
            let source = require_spec(args.source.clone(), env.source.clone(), "source")?;
            let destination =
                require_spec(args.destination.clone(), env.dest.clone(), "destination")?;
            let options = build_options(&args, &env)?;
            let estimate = ferry::estimate(&source, &destination, &options).await?;
            if json {
                Ok(serde_json::to_string_pretty(&estimate)?)
            } else {
                Ok(format!(
                    "files: {}\n\
                     bytes: {}\n\
                     estimated time: {:.1?} at {}\n\
                     recommendation: {}\n\
                     reason: {}",
                    estimate.files_total,
                    bytesize::ByteSize(estimate.bytes_total),
                    estimate.estimated_time,
                    estimate.estimated_speed,
                    estimate.recommendation,
                    estimate.reason
                ))
            }
        }
    }
}

fn main() {
    let args = Args::from_args();
    let env = EnvDefaults::load();
    let progress_settings = (args.progress
        || args.progress_type.is_some()
        || args.progress_delay.is_some())
    .then(|| common::ProgressSettings {
        progress_type: args.progress_type.unwrap_or_default(),
        progress_delay: args.progress_delay.clone(),
    });
    let command = args.command.clone();
    let json = args.json;
    let result = common::run(
        progress_settings,
        args.quiet,
        args.verbose,
        args.max_workers,
        move || run_command(command, env, json),
    );
    match result {
        Ok(output) => println!("{}", output),
        Err(error) => {
            let code = exit_code_of(&error);
            if !args.quiet {
                eprintln!("ferry: {:#}", error);
                let suggestion = code.suggestion();
                if !suggestion.is_empty() {
                    eprintln!("hint: {}", suggestion);
                }
            }
            std::process::exit(code.code());
        }
    }
}
