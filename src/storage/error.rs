//! Error taxonomy for bootable media builds.

use std::path::PathBuf;

use crate::units::human;

use super::writer::Stage;

/// Why a bootable media build did not reach [`Stage::Done`].
///
/// Everything except [`BuildError::WriteFailed`] is raised before the device
/// is touched.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(
        "device {} is too small: {} available, more than {} required",
        .device.display(), human(*.capacity), human(*.required)
    )]
    InsufficientCapacity {
        device: PathBuf,
        capacity: u64,
        required: u64,
    },

    #[error("invalid source image {}: {reason}", .path.display())]
    InvalidSourceImage { path: PathBuf, reason: String },

    #[error("overlay size must be greater than zero")]
    InvalidOverlaySize,

    #[error(
        "overlay of {} does not fit: only {} remain after the boot partition",
        human(*.requested), human(*.available)
    )]
    OverlayTooLarge { requested: u64, available: u64 },

    #[error(
        "storage partition would be {}, below the {} minimum",
        human(*.size), human(*.minimum)
    )]
    StoragePartitionTooSmall { size: u64, minimum: u64 },

    #[error("invalid device {}: {reason}", .device.display())]
    InvalidDevice { device: PathBuf, reason: String },

    #[error("device {} is locked by another build", .device.display())]
    DeviceBusy { device: PathBuf },

    #[error("plan does not match device {}: {reason}", .device.display())]
    PlanMismatch { device: PathBuf, reason: String },

    #[error("cancelled before {before}")]
    Cancelled { before: Stage },

    #[error("write failed during {stage}")]
    WriteFailed {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
}

impl BuildError {
    /// Short, stable name of the error kind for operator-facing output.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::InsufficientCapacity { .. } => "InsufficientCapacity",
            BuildError::InvalidSourceImage { .. } => "InvalidSourceImage",
            BuildError::InvalidOverlaySize => "InvalidOverlaySize",
            BuildError::OverlayTooLarge { .. } => "OverlayTooLarge",
            BuildError::StoragePartitionTooSmall { .. } => "StoragePartitionTooSmall",
            BuildError::InvalidDevice { .. } => "InvalidDevice",
            BuildError::DeviceBusy { .. } => "DeviceBusy",
            BuildError::PlanMismatch { .. } => "PlanMismatch",
            BuildError::Cancelled { .. } => "Cancelled",
            BuildError::WriteFailed { .. } => "WriteFailed",
        }
    }

    /// The stage the device was in when the build stopped, if it got that far.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            BuildError::WriteFailed { stage, .. } => Some(*stage),
            BuildError::Cancelled { before } => Some(*before),
            _ => None,
        }
    }

    /// True if the device may have been modified.
    pub fn device_modified(&self) -> bool {
        match self {
            BuildError::WriteFailed { .. } => true,
            BuildError::Cancelled { before } => *before != Stage::WriteGpt,
            _ => false,
        }
    }
}
