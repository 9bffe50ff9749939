//! Error types for provisioning.
//!
//! Every failure that reaches a caller is a `ProvisionError`. The caller-facing
//! classification is `ErrorKind`, which is stable across releases and maps to a
//! process exit code.

use std::fmt;
use std::io;
use thiserror::Error;

/// Failure classes reported to the caller of a provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidPartitionLayout,
    SourceOpenFailed,
    TargetOpenFailed,
    DecompressionFailed,
    CopyFailed,
    FlashGroupFailed,
    PostInstallFailed,
    RootfsVerificationToggleFailed,
    SecurityModuleClearFailed,
    DutUnreachablePreUpdate,
    DutUnreachablePostUpdate,
    ArchiveDownloadFailed,
    ImageCandidateNotFound,
    StepRevertFailed,
    InvalidRequest,
    UpdateFirmwareFailed,
    CommandFailed,
    Cancelled,
    TimedOutBeforeStart,
    TimedOutWhileRunning,
    Io,
    Wire,
    BuildNotFound,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 23] = [
        ErrorKind::InvalidPartitionLayout,
        ErrorKind::SourceOpenFailed,
        ErrorKind::TargetOpenFailed,
        ErrorKind::DecompressionFailed,
        ErrorKind::CopyFailed,
        ErrorKind::FlashGroupFailed,
        ErrorKind::PostInstallFailed,
        ErrorKind::RootfsVerificationToggleFailed,
        ErrorKind::SecurityModuleClearFailed,
        ErrorKind::DutUnreachablePreUpdate,
        ErrorKind::DutUnreachablePostUpdate,
        ErrorKind::ArchiveDownloadFailed,
        ErrorKind::ImageCandidateNotFound,
        ErrorKind::StepRevertFailed,
        ErrorKind::InvalidRequest,
        ErrorKind::UpdateFirmwareFailed,
        ErrorKind::CommandFailed,
        ErrorKind::Cancelled,
        ErrorKind::TimedOutBeforeStart,
        ErrorKind::TimedOutWhileRunning,
        ErrorKind::Io,
        ErrorKind::Wire,
        ErrorKind::BuildNotFound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPartitionLayout => "invalid_partition_layout",
            ErrorKind::SourceOpenFailed => "source_open_failed",
            ErrorKind::TargetOpenFailed => "target_open_failed",
            ErrorKind::DecompressionFailed => "decompression_failed",
            ErrorKind::CopyFailed => "copy_failed",
            ErrorKind::FlashGroupFailed => "flash_group_failed",
            ErrorKind::PostInstallFailed => "post_install_failed",
            ErrorKind::RootfsVerificationToggleFailed => "rootfs_verification_toggle_failed",
            ErrorKind::SecurityModuleClearFailed => "security_module_clear_failed",
            ErrorKind::DutUnreachablePreUpdate => "dut_unreachable_pre_update",
            ErrorKind::DutUnreachablePostUpdate => "dut_unreachable_post_update",
            ErrorKind::ArchiveDownloadFailed => "archive_download_failed",
            ErrorKind::ImageCandidateNotFound => "image_candidate_not_found",
            ErrorKind::StepRevertFailed => "step_revert_failed",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UpdateFirmwareFailed => "update_firmware_failed",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TimedOutBeforeStart => "timed_out_before_start",
            ErrorKind::TimedOutWhileRunning => "timed_out_while_running",
            ErrorKind::Io => "io",
            ErrorKind::Wire => "wire",
            ErrorKind::BuildNotFound => "build_not_found",
        }
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::InvalidRequest => 2,
            ErrorKind::InvalidPartitionLayout => 3,
            ErrorKind::DutUnreachablePreUpdate => 4,
            ErrorKind::BuildNotFound => 5,
            ErrorKind::SourceOpenFailed => 10,
            ErrorKind::TargetOpenFailed => 11,
            ErrorKind::DecompressionFailed => 12,
            ErrorKind::CopyFailed => 13,
            ErrorKind::FlashGroupFailed => 14,
            ErrorKind::PostInstallFailed => 20,
            ErrorKind::RootfsVerificationToggleFailed => 21,
            ErrorKind::SecurityModuleClearFailed => 22,
            ErrorKind::DutUnreachablePostUpdate => 23,
            ErrorKind::ArchiveDownloadFailed => 30,
            ErrorKind::ImageCandidateNotFound => 31,
            ErrorKind::UpdateFirmwareFailed => 32,
            ErrorKind::StepRevertFailed => 40,
            ErrorKind::CommandFailed => 41,
            ErrorKind::Cancelled => 42,
            ErrorKind::TimedOutBeforeStart => 50,
            ErrorKind::TimedOutWhileRunning => 51,
            ErrorKind::Io => 60,
            ErrorKind::Wire => 61,
        }
    }

    /// Inverse of `exit_code`. Codes no kind uses (1, ssh's 255) give `None`.
    pub fn from_exit_code(code: i32) -> Option<ErrorKind> {
        ErrorKind::ALL.into_iter().find(|k| k.exit_code() == code)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid partition layout: {0}")]
    InvalidPartitionLayout(String),

    #[error("cannot open source {artifact}: {source}")]
    SourceOpenFailed {
        artifact: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot open target {target}: {source}")]
    TargetOpenFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("decompressing {artifact} failed: {source}")]
    DecompressionFailed {
        artifact: String,
        #[source]
        source: io::Error,
    },

    #[error("copy to {target} failed after {written} bytes: {source}")]
    CopyFailed {
        target: String,
        written: u64,
        #[source]
        source: io::Error,
    },

    #[error("{failed} of {total} flash tasks failed, first failure: {first}")]
    FlashGroupFailed {
        failed: usize,
        total: usize,
        first: Box<ProvisionError>,
    },

    #[error("post-install failed: {0}")]
    PostInstallFailed(String),

    #[error("disabling rootfs verification failed: {0}")]
    RootfsVerificationToggleFailed(String),

    #[error("clearing TPM owner failed: {0}")]
    SecurityModuleClearFailed(String),

    #[error("DUT unreachable before update: {0}")]
    DutUnreachablePreUpdate(String),

    #[error("DUT unreachable after update: {0}")]
    DutUnreachablePostUpdate(String),

    #[error("downloading archive {path} failed: {reason}")]
    ArchiveDownloadFailed { path: String, reason: String },

    #[error(
        "could not find an {image} image named any of: {candidates:?}. \
         Files in archive: {members:?}. Specifying board and model may help"
    )]
    ImageCandidateNotFound {
        image: &'static str,
        candidates: Vec<String>,
        members: Vec<String>,
    },

    #[error("reverting {command} failed: {reason}")]
    StepRevertFailed { command: String, reason: String },

    /// A step of a state machine failed. Classified by its original cause.
    #[error("{step}: {message}, {source}{}", format_revert_errors(.revert_errors))]
    StepFailed {
        step: &'static str,
        message: String,
        source: Box<ProvisionError>,
        revert_errors: Vec<ProvisionError>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("firmware update failed: {0}")]
    UpdateFirmwareFailed(String),

    #[error("`{command}` failed on {host}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        stderr: String,
        /// Exit status of the command, when it exited normally
        code: Option<i32>,
    },

    /// The on-device agent failed and reported the class through its exit code.
    #[error("agent on {host} failed ({kind}): {detail}")]
    AgentFailed {
        host: String,
        kind: ErrorKind,
        detail: String,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline of {0:?} expired before provisioning started")]
    TimedOutBeforeStart(std::time::Duration),

    #[error("deadline of {0:?} expired while provisioning")]
    TimedOutWhileRunning(std::time::Duration),

    #[error("no usable build: {0}")]
    BuildNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("wire format error: {0}")]
    Wire(#[from] bincode::Error),
}

fn format_revert_errors(errors: &[ProvisionError]) -> String {
    if errors.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!(" (revert failures: {})", joined.join("; "))
}

impl ProvisionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::InvalidPartitionLayout(_) => ErrorKind::InvalidPartitionLayout,
            ProvisionError::SourceOpenFailed { .. } => ErrorKind::SourceOpenFailed,
            ProvisionError::TargetOpenFailed { .. } => ErrorKind::TargetOpenFailed,
            ProvisionError::DecompressionFailed { .. } => ErrorKind::DecompressionFailed,
            ProvisionError::CopyFailed { .. } => ErrorKind::CopyFailed,
            ProvisionError::FlashGroupFailed { .. } => ErrorKind::FlashGroupFailed,
            ProvisionError::PostInstallFailed(_) => ErrorKind::PostInstallFailed,
            ProvisionError::RootfsVerificationToggleFailed(_) => {
                ErrorKind::RootfsVerificationToggleFailed
            }
            ProvisionError::SecurityModuleClearFailed(_) => ErrorKind::SecurityModuleClearFailed,
            ProvisionError::DutUnreachablePreUpdate(_) => ErrorKind::DutUnreachablePreUpdate,
            ProvisionError::DutUnreachablePostUpdate(_) => ErrorKind::DutUnreachablePostUpdate,
            ProvisionError::ArchiveDownloadFailed { .. } => ErrorKind::ArchiveDownloadFailed,
            ProvisionError::ImageCandidateNotFound { .. } => ErrorKind::ImageCandidateNotFound,
            ProvisionError::StepRevertFailed { .. } => ErrorKind::StepRevertFailed,
            ProvisionError::StepFailed { source, .. } => source.kind(),
            ProvisionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ProvisionError::UpdateFirmwareFailed(_) => ErrorKind::UpdateFirmwareFailed,
            ProvisionError::CommandFailed { .. } => ErrorKind::CommandFailed,
            ProvisionError::AgentFailed { kind, .. } => *kind,
            ProvisionError::Cancelled(_) => ErrorKind::Cancelled,
            ProvisionError::TimedOutBeforeStart(_) => ErrorKind::TimedOutBeforeStart,
            ProvisionError::TimedOutWhileRunning(_) => ErrorKind::TimedOutWhileRunning,
            ProvisionError::BuildNotFound(_) => ErrorKind::BuildNotFound,
            ProvisionError::Io(_) => ErrorKind::Io,
            ProvisionError::Wire(_) => ErrorKind::Wire,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProvisionError::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, ProvisionError>;
