//! Driver-wide error taxonomy and its deterministic mapping onto the
//! semantic status codes of the control-plane surface.
//!
//! Variants are typed values carrying a cause chain; the transport
//! adapters only ever see `Error::code()` plus the display string.
//! Display strings are safe for external eyes: no credentials, no
//! command transcripts, no appliance paths. Full chains go to the log.

use nvmeadm::NvmeError;
use rds::RdsError;
use snafu::Snafu;
use std::time::Duration;

/// Semantic status codes, one-to-one with the CSI-equivalent surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    Aborted,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Volume '{}' not found", id))]
    VolumeNotFound { id: String },
    #[snafu(display("Volume '{}' already exists with a different size", id))]
    VolumeExists { id: String },
    #[snafu(display("Snapshot '{}' not found", id))]
    SnapshotNotFound { id: String },
    #[snafu(display(
        "Snapshot '{}' already exists for a different source volume",
        id
    ))]
    SnapshotExists { id: String },
    #[snafu(display("Node '{}' is not known", node_id))]
    NodeNotFound { node_id: String },
    #[snafu(display("Invalid parameter: {}", text))]
    InvalidParameter { text: String },
    #[snafu(display("Out of resources: {}", text))]
    ResourcesExhausted { text: String },
    #[snafu(display("Operation timed out: {}", text))]
    OperationTimeout { text: String },
    #[snafu(display("No NVMe device appeared for nqn {}", nqn))]
    DeviceNotFound { nqn: String },
    #[snafu(display(
        "Device {} is still in use by: {}",
        device,
        holders.join(", ")
    ))]
    DeviceInUse { device: String, holders: Vec<String> },
    #[snafu(display(
        "Device {} carries a {} filesystem, volume requests {}",
        device,
        found,
        requested
    ))]
    FilesystemMismatch {
        device: String,
        found: String,
        requested: String,
    },
    #[snafu(display("Failed to mount {}: {}", target, detail))]
    MountFailed { target: String, detail: String },
    #[snafu(display("Failed to unmount {}: {}", target, detail))]
    UnmountFailed { target: String, detail: String },
    #[snafu(display(
        "Attachment rejected for volume '{}': {}",
        volume_id,
        reason
    ))]
    AttachmentDenied { volume_id: String, reason: String },
    #[snafu(display(
        "Migration of volume '{}' exceeded its {:?} window ({:?} elapsed); \
         detach the source node before retrying",
        volume_id,
        timeout,
        elapsed
    ))]
    MigrationTimedOut {
        volume_id: String,
        timeout: Duration,
        elapsed: Duration,
    },
    #[snafu(display("Invalid pagination token '{}'", token))]
    InvalidToken { token: String },
    #[snafu(display("Failed to parse backend output: {}", text))]
    ParseFailed { text: String },
    #[snafu(display("Backend temporarily unavailable: {}", text))]
    Unavailable { text: String },
    #[snafu(display("Internal error: {}", text))]
    Internal { text: String },
}

impl Error {
    /// Deterministic status mapping. Idempotent-success conversions
    /// (delete of something already gone) happen at operation sites,
    /// never here.
    pub fn code(&self) -> Code {
        match self {
            Error::VolumeNotFound { .. }
            | Error::SnapshotNotFound { .. }
            | Error::NodeNotFound { .. } => Code::NotFound,
            Error::VolumeExists { .. } | Error::SnapshotExists { .. } => {
                Code::AlreadyExists
            }
            Error::InvalidParameter { .. } => Code::InvalidArgument,
            Error::ResourcesExhausted { .. } => Code::ResourceExhausted,
            Error::OperationTimeout { .. } => Code::DeadlineExceeded,
            Error::DeviceNotFound { .. } => Code::DeadlineExceeded,
            Error::DeviceInUse { .. }
            | Error::AttachmentDenied { .. }
            | Error::MigrationTimedOut { .. } => Code::FailedPrecondition,
            Error::FilesystemMismatch { .. }
            | Error::MountFailed { .. }
            | Error::UnmountFailed { .. } => Code::FailedPrecondition,
            Error::InvalidToken { .. } => Code::Aborted,
            Error::Unavailable { .. } => Code::Unavailable,
            Error::ParseFailed { .. } | Error::Internal { .. } => {
                Code::Internal
            }
        }
    }
}

impl From<RdsError> for Error {
    fn from(error: RdsError) -> Self {
        match error {
            RdsError::VolumeNotFound { id } => Error::VolumeNotFound { id },
            RdsError::VolumeExists { id } => Error::VolumeExists { id },
            RdsError::SnapshotNotFound { id } => Error::SnapshotNotFound { id },
            RdsError::SnapshotExists { id } => Error::SnapshotExists { id },
            RdsError::InvalidParameter { text } => {
                Error::InvalidParameter { text }
            }
            RdsError::ResourceExhausted { text } => {
                Error::ResourcesExhausted { text }
            }
            RdsError::OperationTimeout { text } => {
                Error::OperationTimeout { text }
            }
            RdsError::Parse { text } => Error::ParseFailed { text },
            RdsError::CircuitOpen {} => Error::Unavailable {
                text: "storage appliance circuit breaker is open".to_string(),
            },
            RdsError::PoolClosed {} => Error::Unavailable {
                text: "storage appliance channel is shut down".to_string(),
            },
            error @ RdsError::Ssh { .. }
            | error @ RdsError::Transport { .. } => {
                warn!("appliance transport error: {}", error);
                Error::Unavailable {
                    text: "storage appliance is unreachable".to_string(),
                }
            }
            RdsError::CommandFailed { verb, detail } => {
                error!("appliance command '{}' failed: {}", verb, detail);
                Error::Internal {
                    text: format!("appliance rejected operation '{}'", verb),
                }
            }
        }
    }
}

impl From<NvmeError> for Error {
    fn from(error: NvmeError) -> Self {
        match error {
            NvmeError::DeviceNotFound { nqn }
            | NvmeError::NotConnected { nqn } => Error::DeviceNotFound { nqn },
            NvmeError::DeviceInUse { device, holders } => {
                Error::DeviceInUse { device, holders }
            }
            NvmeError::InvalidParam { text } => Error::InvalidParameter { text },
            other => {
                warn!("nvme fabric error: {}", other);
                Error::Internal {
                    text: format!("nvme fabric operation failed: {}", other),
                }
            }
        }
    }
}
