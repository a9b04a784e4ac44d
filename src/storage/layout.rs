//! Partition layout computation.
//!
//! The layout is a strict three-way allocation over the device's usable
//! sectors:
//!
//! ```text
//! | primary GPT | boot (ISO) | overlay | storage ............ | backup GPT |
//! 0             ^aligned     ^aligned  ^aligned               last usable ^
//! ```
//!
//! Fixed costs (both GPT copies and the boot partition) are taken first, the
//! overlay second, and the storage partition receives every remaining sector
//! up to the last usable LBA. Nothing is rebalanced: if the remainder is not
//! positive the plan fails rather than shrinking the overlay.

use std::path::PathBuf;

use anyhow::{ensure, Result};
use serde::Serialize;

use crate::config::{BootableConfig, Filesystem};
use crate::units::{human, round_up};

use super::blockdev::BlockDevice;
use super::error::BuildError;
use super::iso::SourceImage;

/// Size of one GPT partition entry.
pub const GPT_ENTRY_SIZE: u64 = 128;

/// Number of entries in the partition array.
pub const GPT_ENTRY_COUNT: u64 = 128;

/// EFI System Partition type GUID.
pub const ESP_TYPE_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// Linux filesystem data type GUID.
pub const LINUX_FS_TYPE_GUID: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Sectors occupied by the partition entry array.
pub fn entry_array_sectors(sector_size: u64) -> u64 {
    (GPT_ENTRY_SIZE * GPT_ENTRY_COUNT).div_ceil(sector_size)
}

/// Knobs that shape a layout. Built from `crucible.yml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPolicy {
    pub default_overlay_size: u64,
    pub alignment: u64,
    pub min_storage_size: u64,
    pub boot_label: String,
    pub overlay_label: String,
    pub storage_label: String,
    pub overlay_fs: Filesystem,
    pub storage_fs: Filesystem,
}

impl From<&BootableConfig> for LayoutPolicy {
    fn from(config: &BootableConfig) -> Self {
        Self {
            default_overlay_size: config.overlay_size,
            alignment: config.alignment,
            min_storage_size: config.min_storage_size,
            boot_label: config.boot_label.clone(),
            overlay_label: config.overlay_label.clone(),
            storage_label: config.storage_label.clone(),
            overlay_fs: config.overlay_fs,
            storage_fs: config.storage_fs,
        }
    }
}

impl Default for LayoutPolicy {
    fn default() -> Self {
        Self::from(&BootableConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionRole {
    Boot,
    Overlay,
    Storage,
}

/// One GPT partition entry of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub number: u32,
    pub role: PartitionRole,
    pub label: String,
    pub type_guid: &'static str,
    /// Filesystem to create. The boot partition holds the raw ISO instead.
    pub filesystem: Option<Filesystem>,
    pub start_lba: u64,
    pub sectors: u64,
}

impl Partition {
    /// Last LBA of the partition, inclusive.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors - 1
    }

    pub fn offset_bytes(&self, sector_size: u64) -> u64 {
        self.start_lba * sector_size
    }

    pub fn size_bytes(&self, sector_size: u64) -> u64 {
        self.sectors * sector_size
    }

    fn sfdisk_line(&self) -> String {
        format!(
            "start={}, size={}, type={}, name=\"{}\"",
            self.start_lba, self.sectors, self.type_guid, self.label
        )
    }
}

/// Sectors reserved for GPT metadata (and alignment padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub start_lba: u64,
    pub sectors: u64,
}

/// A named, contiguous run of sectors. Used to check plan coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub name: &'static str,
    pub start_lba: u64,
    pub sectors: u64,
}

/// The computed layout for one device and one source image.
///
/// Immutable once computed. [`super::writer::write_plan`] refuses a plan
/// whose geometry no longer matches the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionPlan {
    pub device: PathBuf,
    pub capacity: u64,
    pub sector_size: u64,
    pub alignment_sectors: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub primary_gpt: Reservation,
    pub boot: Partition,
    pub overlay: Partition,
    pub storage: Partition,
    pub backup_gpt: Reservation,
    /// Overlay size as asked for, before alignment.
    pub requested_overlay_size: u64,
    /// True when no overlay size was given and the policy default applied.
    pub overlay_defaulted: bool,
}

/// Compute a partition plan. Pure: the device is not opened.
pub fn plan_layout(
    device: &BlockDevice,
    image: &SourceImage,
    overlay_size: Option<u64>,
    policy: &LayoutPolicy,
) -> Result<PartitionPlan, BuildError> {
    let ss = device.sector_size();
    let capacity = device.capacity();
    let total = device.total_sectors();

    if image.size == 0 {
        return Err(BuildError::InvalidSourceImage {
            path: image.path.clone(),
            reason: "image is empty".to_string(),
        });
    }
    if !image.uefi_bootable {
        return Err(BuildError::InvalidSourceImage {
            path: image.path.clone(),
            reason: "no UEFI El Torito boot entry".to_string(),
        });
    }
    if overlay_size == Some(0) {
        return Err(BuildError::InvalidOverlaySize);
    }

    let align = policy.alignment.div_ceil(ss).max(1);
    let entries = entry_array_sectors(ss);
    // Protective MBR + primary header + entry array.
    let first_usable = 2 + entries;
    // Entry array copy + backup header.
    let backup_sectors = entries + 1;

    let boot_start = round_up(first_usable, align);
    let boot_sectors = round_up(image.size.div_ceil(ss), align);
    let overlay_start = boot_start + boot_sectors;
    let fixed = overlay_start + backup_sectors;

    if total <= fixed {
        return Err(BuildError::InsufficientCapacity {
            device: device.path().to_path_buf(),
            capacity,
            required: fixed * ss,
        });
    }

    let last_usable = total - backup_sectors - 1;
    let available = total - fixed;

    let (requested, defaulted) = match overlay_size {
        Some(size) => (size, false),
        None => (policy.default_overlay_size, true),
    };
    if requested == 0 {
        return Err(BuildError::InvalidOverlaySize);
    }
    let overlay_sectors = round_up(requested.div_ceil(ss), align);
    if overlay_sectors >= available {
        return Err(BuildError::OverlayTooLarge {
            requested,
            available: available * ss,
        });
    }

    let storage_start = overlay_start + overlay_sectors;
    let storage_sectors = last_usable + 1 - storage_start;
    let min_storage = policy.min_storage_size.div_ceil(ss).max(1);
    if storage_sectors < min_storage {
        return Err(BuildError::StoragePartitionTooSmall {
            size: storage_sectors * ss,
            minimum: min_storage * ss,
        });
    }

    let plan = PartitionPlan {
        device: device.path().to_path_buf(),
        capacity,
        sector_size: ss,
        alignment_sectors: align,
        first_usable_lba: first_usable,
        last_usable_lba: last_usable,
        primary_gpt: Reservation {
            start_lba: 0,
            sectors: boot_start,
        },
        boot: Partition {
            number: 1,
            role: PartitionRole::Boot,
            label: policy.boot_label.clone(),
            type_guid: ESP_TYPE_GUID,
            filesystem: None,
            start_lba: boot_start,
            sectors: boot_sectors,
        },
        overlay: Partition {
            number: 2,
            role: PartitionRole::Overlay,
            label: policy.overlay_label.clone(),
            type_guid: LINUX_FS_TYPE_GUID,
            filesystem: Some(policy.overlay_fs),
            start_lba: overlay_start,
            sectors: overlay_sectors,
        },
        storage: Partition {
            number: 3,
            role: PartitionRole::Storage,
            label: policy.storage_label.clone(),
            type_guid: LINUX_FS_TYPE_GUID,
            filesystem: Some(policy.storage_fs),
            start_lba: storage_start,
            sectors: storage_sectors,
        },
        backup_gpt: Reservation {
            start_lba: last_usable + 1,
            sectors: backup_sectors,
        },
        requested_overlay_size: requested,
        overlay_defaulted: defaulted,
    };

    tracing::debug!(
        device = %plan.device.display(),
        boot_sectors,
        overlay_sectors,
        storage_sectors,
        "computed layout"
    );
    Ok(plan)
}

impl PartitionPlan {
    pub fn total_sectors(&self) -> u64 {
        self.capacity / self.sector_size
    }

    /// Partitions in table order.
    pub fn partitions(&self) -> [&Partition; 3] {
        [&self.boot, &self.overlay, &self.storage]
    }

    /// Every extent of the device in LBA order.
    pub fn extents(&self) -> Vec<Extent> {
        vec![
            Extent {
                name: "primary-gpt",
                start_lba: self.primary_gpt.start_lba,
                sectors: self.primary_gpt.sectors,
            },
            Extent {
                name: "boot",
                start_lba: self.boot.start_lba,
                sectors: self.boot.sectors,
            },
            Extent {
                name: "overlay",
                start_lba: self.overlay.start_lba,
                sectors: self.overlay.sectors,
            },
            Extent {
                name: "storage",
                start_lba: self.storage.start_lba,
                sectors: self.storage.sectors,
            },
            Extent {
                name: "backup-gpt",
                start_lba: self.backup_gpt.start_lba,
                sectors: self.backup_gpt.sectors,
            },
        ]
    }

    /// Sectors consumed by GPT metadata and the boot partition.
    pub fn fixed_sectors(&self) -> u64 {
        self.primary_gpt.sectors + self.boot.sectors + self.backup_gpt.sectors
    }

    /// Check the structural invariants of the plan.
    pub fn verify(&self) -> Result<()> {
        let ss = self.sector_size;
        ensure!(
            ss >= 512 && ss.is_power_of_two(),
            "sector size {ss} is not a power of two >= 512"
        );
        ensure!(
            self.capacity % ss == 0,
            "capacity {} is not a whole number of sectors",
            self.capacity
        );

        let mut next = 0;
        for extent in self.extents() {
            ensure!(extent.sectors > 0, "{} extent is empty", extent.name);
            ensure!(
                extent.start_lba == next,
                "{} starts at LBA {} but the previous extent ends at LBA {}",
                extent.name,
                extent.start_lba,
                next
            );
            next = extent.start_lba + extent.sectors;
        }
        ensure!(
            next == self.total_sectors(),
            "extents cover {} of {} sectors",
            next,
            self.total_sectors()
        );

        for part in self.partitions() {
            ensure!(
                part.start_lba >= self.first_usable_lba && part.end_lba() <= self.last_usable_lba,
                "partition {} lies outside the usable LBA range",
                part.number
            );
        }
        for part in [&self.boot, &self.overlay, &self.storage] {
            ensure!(
                part.start_lba % self.alignment_sectors == 0,
                "partition {} is not aligned",
                part.number
            );
        }
        Ok(())
    }

    /// Header lines shared by both sfdisk scripts.
    ///
    /// LBAs are in device sectors. sfdisk learns the sector size from the
    /// kernel for block devices and from `--sector-size` for image files.
    fn sfdisk_header(&self) -> String {
        format!(
            "label: gpt\nunit: sectors\nfirst-lba: {}\nlast-lba: {}\ntable-length: {}\n",
            self.first_usable_lba, self.last_usable_lba, GPT_ENTRY_COUNT
        )
    }

    /// sfdisk script for a GPT with no partitions.
    pub fn empty_table_script(&self) -> String {
        self.sfdisk_header()
    }

    /// sfdisk script creating all three partitions.
    pub fn to_sfdisk_script(&self) -> String {
        let mut script = self.sfdisk_header();
        script.push('\n');
        for part in self.partitions() {
            script.push_str(&part.sfdisk_line());
            script.push('\n');
        }
        script
    }

    /// Print the plan in the same style as the rest of the CLI output.
    pub fn print(&self) {
        let ss = self.sector_size;
        println!(
            "Layout for {} ({}, {}-byte sectors):",
            self.device.display(),
            human(self.capacity),
            ss
        );
        println!(
            "  {:<4} {:<8} {:<10} {:>14} {:>14}  {}",
            "#", "role", "label", "start", "sectors", "size"
        );
        for part in self.partitions() {
            let role = match part.role {
                PartitionRole::Boot => "boot",
                PartitionRole::Overlay => "overlay",
                PartitionRole::Storage => "storage",
            };
            let fs = part
                .filesystem
                .map(|fs| fs.to_string())
                .unwrap_or_else(|| "iso9660".to_string());
            println!(
                "  {:<4} {:<8} {:<10} {:>14} {:>14}  {} ({})",
                part.number,
                role,
                part.label,
                part.start_lba,
                part.sectors,
                human(part.size_bytes(ss)),
                fs
            );
        }
        if self.overlay_defaulted {
            println!(
                "  overlay size defaulted to {}",
                human(self.requested_overlay_size)
            );
        }
    }
}
