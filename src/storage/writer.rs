//! Staged construction of a bootable device from a [`PartitionPlan`].
//!
//! The build walks a fixed sequence of stages. The first failing stage ends
//! the build with [`BuildError::WriteFailed`] naming that stage; later stages
//! never run. Cancellation is only observed between stages so no stage is
//! interrupted half-way.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::cancel::CancelToken;
use crate::timing::Timer;

use super::blockdev::BlockDevice;
use super::error::BuildError;
use super::iso::SourceImage;
use super::layout::PartitionPlan;

/// Build stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stage {
    Validate,
    #[serde(rename = "WriteGPT")]
    WriteGpt,
    CreatePartitions,
    FormatPartitions,
    CopyImage,
    #[serde(rename = "WriteBackupGPT")]
    WriteBackupGpt,
    Done,
}

impl Stage {
    /// Stages that write to the device.
    pub const WRITES: [Stage; 5] = [
        Stage::WriteGpt,
        Stage::CreatePartitions,
        Stage::FormatPartitions,
        Stage::CopyImage,
        Stage::WriteBackupGpt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validate => "Validate",
            Stage::WriteGpt => "WriteGPT",
            Stage::CreatePartitions => "CreatePartitions",
            Stage::FormatPartitions => "FormatPartitions",
            Stage::CopyImage => "CopyImage",
            Stage::WriteBackupGpt => "WriteBackupGPT",
            Stage::Done => "Done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The device-writing half of a build, one method per stage.
///
/// Implementations may assume they are called in stage order and that the
/// plan has already been validated against the device.
pub trait MediaBackend {
    /// Clear old signatures; write a protective MBR and an empty GPT.
    fn write_gpt(&mut self, plan: &PartitionPlan) -> anyhow::Result<()>;

    /// Write the partition entries and make the kernel see them.
    fn create_partitions(&mut self, plan: &PartitionPlan) -> anyhow::Result<()>;

    /// Create the overlay and storage filesystems.
    fn format_partitions(&mut self, plan: &PartitionPlan) -> anyhow::Result<()>;

    /// Copy the source image into the boot partition.
    fn copy_image(&mut self, plan: &PartitionPlan, image: &SourceImage) -> anyhow::Result<()>;

    /// Place the backup GPT at the end of the device and flush.
    fn write_backup_gpt(&mut self, plan: &PartitionPlan) -> anyhow::Result<()>;
}

/// A completed build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub plan: PartitionPlan,
    pub completed: Vec<Stage>,
    pub elapsed: Duration,
}

pub type BuildResult = Result<BuildReport, BuildError>;

/// Write `plan` to `device`.
///
/// Returns success only after every stage through `WriteBackupGPT` finished.
pub fn write_plan(
    device: &BlockDevice,
    plan: &PartitionPlan,
    image: &SourceImage,
    backend: &mut dyn MediaBackend,
    cancel: &CancelToken,
) -> BuildResult {
    let started = Instant::now();
    let mut completed = Vec::with_capacity(Stage::WRITES.len() + 2);

    validate(device, plan, image)?;
    completed.push(Stage::Validate);

    for stage in Stage::WRITES {
        if cancel.is_cancelled() {
            tracing::warn!(%stage, "build cancelled");
            return Err(BuildError::Cancelled { before: stage });
        }

        tracing::info!(%stage, device = %device.path().display(), "starting stage");
        let timer = Timer::start(stage.name());
        let result = match stage {
            Stage::WriteGpt => backend.write_gpt(plan),
            Stage::CreatePartitions => backend.create_partitions(plan),
            Stage::FormatPartitions => backend.format_partitions(plan),
            Stage::CopyImage => backend.copy_image(plan, image),
            Stage::WriteBackupGpt => backend.write_backup_gpt(plan),
            Stage::Validate | Stage::Done => Ok(()),
        };
        timer.finish();

        if let Err(source) = result {
            tracing::error!(%stage, "stage failed: {source:#}");
            return Err(BuildError::WriteFailed { stage, source });
        }
        completed.push(stage);
    }

    completed.push(Stage::Done);
    Ok(BuildReport {
        plan: plan.clone(),
        completed,
        elapsed: started.elapsed(),
    })
}

/// Refuse plans computed for a different device or a different image.
fn validate(
    device: &BlockDevice,
    plan: &PartitionPlan,
    image: &SourceImage,
) -> Result<(), BuildError> {
    let mismatch = |reason: String| BuildError::PlanMismatch {
        device: device.path().to_path_buf(),
        reason,
    };

    if plan.device != device.path() {
        return Err(mismatch(format!(
            "plan was computed for {}",
            plan.device.display()
        )));
    }
    if plan.capacity != device.capacity() || plan.sector_size != device.sector_size() {
        return Err(mismatch(format!(
            "plan geometry {} bytes / {}-byte sectors, device has {} / {}",
            plan.capacity,
            plan.sector_size,
            device.capacity(),
            device.sector_size()
        )));
    }
    if image.size > plan.boot.size_bytes(plan.sector_size) {
        return Err(mismatch(format!(
            "image {} ({} bytes) does not fit the {}-byte boot partition",
            image.path.display(),
            image.size,
            plan.boot.size_bytes(plan.sector_size)
        )));
    }
    plan.verify().map_err(|e| mismatch(format!("{e:#}")))
}
