//! Categorized exit codes.
//!
//! Every failure the tool can report maps to a numeric exit code with a
//! category, a retryable flag and a one-line suggestion, so scripts (and
//! agents) driving the binary can decide what to do next without parsing
//! error text.

/// Semantic exit codes, grouped by tens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCode {
    Success,
    General,
    Config,
    Auth,
    Network,
    SourceMissing,
    DestNotWritable,
    PermissionDenied,
    DiskFull,
    TransferFailed,
    ChecksumMismatch,
    PartialTransfer,
    EngineMissing,
    UnsupportedProtocol,
    InvalidStrategy,
    UserCanceled,
    Timeout,
    QuotaExceeded,
}

/// Coarse classification used to decide whether retrying can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable,
    Fatal,
    Configuration,
    Auth,
    Resource,
    User,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::General => 1,
            ExitCode::Config => 10,
            ExitCode::Auth => 11,
            ExitCode::Network => 12,
            ExitCode::SourceMissing => 20,
            ExitCode::DestNotWritable => 21,
            ExitCode::PermissionDenied => 22,
            ExitCode::DiskFull => 23,
            ExitCode::TransferFailed => 30,
            ExitCode::ChecksumMismatch => 31,
            ExitCode::PartialTransfer => 32,
            ExitCode::EngineMissing => 40,
            ExitCode::UnsupportedProtocol => 41,
            ExitCode::InvalidStrategy => 42,
            ExitCode::UserCanceled => 50,
            ExitCode::Timeout => 51,
            ExitCode::QuotaExceeded => 52,
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ExitCode::Success | ExitCode::UserCanceled => ErrorCategory::User,
            ExitCode::Network
            | ExitCode::TransferFailed
            | ExitCode::PartialTransfer
            | ExitCode::Timeout => ErrorCategory::Retryable,
            ExitCode::Config
            | ExitCode::EngineMissing
            | ExitCode::UnsupportedProtocol
            | ExitCode::InvalidStrategy => ErrorCategory::Configuration,
            ExitCode::Auth | ExitCode::PermissionDenied => ErrorCategory::Auth,
            ExitCode::DiskFull | ExitCode::QuotaExceeded => ErrorCategory::Resource,
            ExitCode::General
            | ExitCode::SourceMissing
            | ExitCode::DestNotWritable
            | ExitCode::ChecksumMismatch => ErrorCategory::Fatal,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(
            self,
            ExitCode::Network
                | ExitCode::TransferFailed
                | ExitCode::ChecksumMismatch
                | ExitCode::PartialTransfer
                | ExitCode::Timeout
                | ExitCode::QuotaExceeded
        )
    }

    pub fn suggestion(self) -> &'static str {
        match self {
            ExitCode::Success => "",
            ExitCode::General => "Check logs for details",
            ExitCode::Config => "Check configuration syntax and required fields",
            ExitCode::Auth => "Verify credentials and access permissions",
            ExitCode::Network => "Check network connectivity and retry",
            ExitCode::SourceMissing => "Verify the source path exists and is accessible",
            ExitCode::DestNotWritable => "Check destination permissions and path validity",
            ExitCode::PermissionDenied => "Verify the user has the required permissions",
            ExitCode::DiskFull => "Free up space at the destination or use a different location",
            ExitCode::TransferFailed => {
                "Retry with checkpointing enabled to resume from the failure point"
            }
            ExitCode::ChecksumMismatch => "Data corruption detected, retry the transfer",
            ExitCode::PartialTransfer => "Review the failed files and retry",
            ExitCode::EngineMissing => "Install the required transfer engine (rsync, rclone, ...)",
            ExitCode::UnsupportedProtocol => {
                "Use a different strategy or an engine supporting this protocol"
            }
            ExitCode::InvalidStrategy => "Use one of: auto, rsync, rclone, tar, proxy",
            ExitCode::UserCanceled => "",
            ExitCode::Timeout => "Increase the timeout or check for hanging processes",
            ExitCode::QuotaExceeded => "Wait for the quota to reset or raise the limit",
        }
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// An error tagged with the exit code it should produce.
///
/// Wraps an [`anyhow::Error`] so the categorization can travel through
/// `?`-propagation and be recovered with a downcast at the top level.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct CategorizedError {
    pub code: ExitCode,
    #[source]
    pub source: anyhow::Error,
}

impl CategorizedError {
    pub fn new(code: ExitCode, source: anyhow::Error) -> Self {
        Self { code, source }
    }
}

/// Extension trait to attach an exit code to any fallible result.
pub trait Categorize<T> {
    fn categorize(self, code: ExitCode) -> anyhow::Result<T>;
}

impl<T, E> Categorize<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn categorize(self, code: ExitCode) -> anyhow::Result<T> {
        self.map_err(|e| CategorizedError::new(code, e.into()).into())
    }
}

/// Recover the exit code from an error chain; uncategorized errors are
/// reported as the general failure.
pub fn exit_code_of(err: &anyhow::Error) -> ExitCode {
    for cause in err.chain() {
        if let Some(categorized) = cause.downcast_ref::<CategorizedError>() {
            return categorized.code;
        }
    }
    ExitCode::General
}
