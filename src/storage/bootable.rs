//! `storage bootable`: probe, lock, inspect, plan, then write.

use std::path::PathBuf;

use crate::cancel::CancelToken;
use crate::config::{BootableConfig, Filesystem};

use super::backend::DeviceBackend;
use super::blockdev::{BlockDevice, DeviceKind, DeviceLock};
use super::error::BuildError;
use super::iso::{ImageLock, SourceImage};
use super::layout::{plan_layout, LayoutPolicy, PartitionPlan};
use super::writer::{write_plan, BuildResult};

/// What the operator asked for.
#[derive(Debug, Clone)]
pub struct BootableRequest {
    pub device: PathBuf,
    pub iso: PathBuf,
    /// `None` applies the configured default.
    pub overlay_size: Option<u64>,
}

/// Everything needed to write a device, with the device and image locks held.
///
/// Dropping a `PreparedBuild` without executing it releases both locks and
/// leaves the device untouched.
#[derive(Debug)]
pub struct PreparedBuild {
    pub device: BlockDevice,
    pub image: SourceImage,
    pub plan: PartitionPlan,
    lock: Option<DeviceLock>,
    image_lock: Option<ImageLock>,
}

/// Resolve inputs and compute the plan.
///
/// With `lock` set the device is locked exclusively and the image shared
/// before planning, and both stay locked until the returned build is
/// dropped. Dry runs pass `false`.
pub fn prepare(
    request: &BootableRequest,
    config: &BootableConfig,
    lock: bool,
) -> Result<PreparedBuild, BuildError> {
    let device = BlockDevice::probe(&request.device, config.image_sector_size)?;
    tracing::info!(
        device = %device.path().display(),
        capacity = device.capacity(),
        sector_size = device.sector_size(),
        model = device.model().unwrap_or("-"),
        "resolved target"
    );

    if device.kind() == DeviceKind::ImageFile
        && (config.overlay_fs == Filesystem::Xfs || config.storage_fs == Filesystem::Xfs)
    {
        return Err(BuildError::InvalidDevice {
            device: device.path().to_path_buf(),
            reason: "xfs partitions require a block device target".to_string(),
        });
    }

    let (lock, image_lock) = if lock {
        (
            Some(DeviceLock::acquire(&device)?),
            Some(ImageLock::acquire(&request.iso)?),
        )
    } else {
        (None, None)
    };

    let image = SourceImage::inspect(&request.iso)?;
    let policy = LayoutPolicy::from(config);
    let plan = plan_layout(&device, &image, request.overlay_size, &policy)?;

    Ok(PreparedBuild {
        device,
        image,
        plan,
        lock,
        image_lock,
    })
}

impl PreparedBuild {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some() && self.image_lock.is_some()
    }

    /// Write the plan with the production backend.
    pub fn execute(&self, verify: bool, cancel: &CancelToken) -> BuildResult {
        if !self.is_locked() {
            return Err(BuildError::InvalidDevice {
                device: self.device.path().to_path_buf(),
                reason: "refusing to write without holding the device lock".to_string(),
            });
        }
        let mut backend = DeviceBackend::new(self.device.clone()).verify(verify);
        write_plan(&self.device, &self.plan, &self.image, &mut backend, cancel)
    }
}
