//! Target device resolution and exclusive locking.
//!
//! A target is either a whole-disk block device (geometry from `lsblk`) or a
//! regular file used as a disk image (geometry from its length and the
//! configured image sector size).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::process::Cmd;

use super::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    BlockDevice,
    ImageFile,
}

/// A resolved build target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    path: PathBuf,
    capacity: u64,
    sector_size: u64,
    kind: DeviceKind,
    model: Option<String>,
}

impl BlockDevice {
    /// Build a device description from known geometry.
    ///
    /// A zero capacity is accepted here and rejected by layout planning.
    pub fn new(
        path: impl Into<PathBuf>,
        capacity: u64,
        sector_size: u64,
        kind: DeviceKind,
    ) -> Result<Self, BuildError> {
        let path = path.into();
        if sector_size < 512 || !sector_size.is_power_of_two() {
            return Err(BuildError::InvalidDevice {
                device: path,
                reason: format!("unsupported logical sector size {sector_size}"),
            });
        }
        if capacity % sector_size != 0 {
            return Err(BuildError::InvalidDevice {
                device: path,
                reason: format!(
                    "capacity {capacity} is not a multiple of the {sector_size}-byte sector size"
                ),
            });
        }
        Ok(Self {
            path,
            capacity,
            sector_size,
            kind,
            model: None,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Resolve `path` into a device description.
    ///
    /// `image_sector_size` is used only for regular files.
    pub fn probe(path: &Path, image_sector_size: u64) -> Result<Self, BuildError> {
        let invalid = |reason: String| BuildError::InvalidDevice {
            device: path.to_path_buf(),
            reason,
        };

        let meta = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
        let file_type = meta.file_type();

        if file_type.is_block_device() {
            let info = lsblk(path).map_err(|e| invalid(format!("{e:#}")))?;
            match info.kind.as_str() {
                "disk" | "loop" => {}
                other => {
                    return Err(invalid(format!(
                        "is a '{other}' device; expected a whole disk"
                    )))
                }
            }
            let device = Self::new(
                path,
                info.size.get(),
                info.log_sec.get(),
                DeviceKind::BlockDevice,
            )?;
            Ok(match info.model {
                Some(model) if !model.trim().is_empty() => device.with_model(model.trim()),
                _ => device,
            })
        } else if file_type.is_file() {
            Self::new(path, meta.len(), image_sector_size, DeviceKind::ImageFile)
        } else {
            Err(invalid(
                "not a block device or regular image file".to_string(),
            ))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn total_sectors(&self) -> u64 {
        self.capacity / self.sector_size
    }

    pub fn is_block_device(&self) -> bool {
        self.kind == DeviceKind::BlockDevice
    }

    /// Device node of partition `number`, e.g. `/dev/sdb1` or `/dev/nvme0n1p1`.
    ///
    /// Image files have no partition nodes.
    pub fn partition_path(&self, number: u32) -> Option<PathBuf> {
        if !self.is_block_device() {
            return None;
        }
        let base = self.path.to_string_lossy();
        let separator = if base.ends_with(|c: char| c.is_ascii_digit()) {
            "p"
        } else {
            ""
        };
        Some(PathBuf::from(format!("{base}{separator}{number}")))
    }
}

/// lsblk prints sizes as numbers or strings depending on its version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkNumber {
    Number(u64),
    Text(String),
}

impl LsblkNumber {
    fn get(&self) -> u64 {
        match self {
            LsblkNumber::Number(n) => *n,
            LsblkNumber::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    size: LsblkNumber,
    #[serde(rename = "log-sec")]
    log_sec: LsblkNumber,
    #[serde(rename = "type")]
    kind: String,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

fn lsblk(path: &Path) -> Result<LsblkDevice> {
    let result = Cmd::new("lsblk")
        .args(["--json", "--bytes", "--nodeps", "--output"])
        .arg("NAME,PATH,SIZE,LOG-SEC,TYPE,MODEL")
        .arg_path(path)
        .error_msg("lsblk failed")
        .run()?;
    parse_lsblk(&result.stdout)
}

fn parse_lsblk(json: &str) -> Result<LsblkDevice> {
    let output: LsblkOutput = serde_json::from_str(json).context("parsing lsblk output")?;
    output
        .blockdevices
        .into_iter()
        .next()
        .context("lsblk reported no device")
}

/// Exclusive advisory lock on a target, held for a whole build.
///
/// Uses `flock(2)`, which is also the protocol udev and util-linux honour
/// for block devices. Released on drop.
#[derive(Debug)]
pub struct DeviceLock {
    file: File,
    path: PathBuf,
}

impl DeviceLock {
    pub fn acquire(device: &BlockDevice) -> Result<Self, BuildError> {
        let path = device.path().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| BuildError::InvalidDevice {
                device: path.clone(),
                reason: format!("cannot open for writing: {e}"),
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::DeviceBusy { device: path });
        }

        tracing::debug!(device = %path.display(), "acquired exclusive lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeviceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(device = %self.path.display(), "failed to release lock: {e}");
        }
    }
}
