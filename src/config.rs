//! Configuration management for crucible.
//!
//! Reads `crucible.yml` (path from `--config`, default `./crucible.yml`).
//! A missing file yields the defaults. Environment variables (including a
//! `.env` file loaded by `main`) take precedence over the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::units::{self, MIB};

/// Default config file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "./crucible.yml";

/// Environment override for the default overlay size.
pub const OVERLAY_SIZE_ENV: &str = "CRUCIBLE_OVERLAY_SIZE";

/// Default size of the persistent overlay (copy-on-write) partition.
pub const DEFAULT_OVERLAY_SIZE: u64 = 50_000 * MIB;

/// A filesystem crucible knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Filesystem {
    Ext4,
    Xfs,
}

impl Filesystem {
    /// The mkfs program for this filesystem.
    pub fn mkfs(&self) -> &'static str {
        match self {
            Filesystem::Ext4 => "mkfs.ext4",
            Filesystem::Xfs => "mkfs.xfs",
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filesystem::Ext4 => f.write_str("ext4"),
            Filesystem::Xfs => f.write_str("xfs"),
        }
    }
}

/// Toplevel `crucible.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// The `storage:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub bootable: BootableConfig,
}

/// Layout and filesystem policy for `storage bootable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct BootableConfig {
    /// Overlay size used when `--overlay-size` is not given.
    #[serde(
        deserialize_with = "units::deserialize_size",
        serialize_with = "units::serialize_size"
    )]
    pub overlay_size: u64,
    pub boot_label: String,
    pub overlay_label: String,
    pub storage_label: String,
    pub overlay_fs: Filesystem,
    pub storage_fs: Filesystem,
    /// Partition start alignment.
    #[serde(
        deserialize_with = "units::deserialize_size",
        serialize_with = "units::serialize_size"
    )]
    pub alignment: u64,
    /// Smallest acceptable storage partition.
    #[serde(
        deserialize_with = "units::deserialize_size",
        serialize_with = "units::serialize_size"
    )]
    pub min_storage_size: u64,
    /// Logical sector size assumed when the target is a regular file.
    pub image_sector_size: u64,
}

impl Default for BootableConfig {
    fn default() -> Self {
        Self {
            overlay_size: DEFAULT_OVERLAY_SIZE,
            boot_label: "BOOT".to_string(),
            // dmsquash-live looks for LABEL=cow when rd.live.overlay is set.
            overlay_label: "cow".to_string(),
            storage_label: "data".to_string(),
            overlay_fs: Filesystem::Ext4,
            storage_fs: Filesystem::Ext4,
            alignment: MIB,
            min_storage_size: MIB,
            image_sector_size: 512,
        }
    }
}

impl Config {
    /// Load configuration from `path` and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config '{}'", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("parsing config '{}'", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        if let Ok(value) = std::env::var(OVERLAY_SIZE_ENV) {
            config.storage.bootable.overlay_size = units::parse_size(&value)
                .with_context(|| format!("parsing {OVERLAY_SIZE_ENV}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; an empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    fn validate(&self) -> Result<()> {
        let bootable = &self.storage.bootable;
        let ss = bootable.image_sector_size;
        anyhow::ensure!(
            ss >= 512 && ss.is_power_of_two(),
            "image-sector-size must be a power of two >= 512, got {ss}"
        );
        anyhow::ensure!(
            bootable.alignment > 0 && bootable.alignment % ss == 0,
            "alignment must be a positive multiple of {ss} bytes"
        );
        for label in [
            &bootable.boot_label,
            &bootable.overlay_label,
            &bootable.storage_label,
        ] {
            anyhow::ensure!(
                !label.is_empty() && label.len() <= 16 && !label.contains(['"', ',', '\n']),
                "invalid partition label '{label}'"
            );
        }
        for (fs, label) in [
            (bootable.overlay_fs, &bootable.overlay_label),
            (bootable.storage_fs, &bootable.storage_label),
        ] {
            // XFS labels are at most 12 bytes.
            anyhow::ensure!(
                fs != Filesystem::Xfs || label.len() <= 12,
                "label '{label}' is too long for xfs"
            );
        }
        Ok(())
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        let b = &self.storage.bootable;
        println!("Configuration:");
        println!("  overlay-size:      {}", units::human(b.overlay_size));
        println!("  boot-label:        {}", b.boot_label);
        println!("  overlay-label:     {} ({})", b.overlay_label, b.overlay_fs);
        println!("  storage-label:     {} ({})", b.storage_label, b.storage_fs);
        println!("  alignment:         {}", units::human(b.alignment));
        println!("  min-storage-size:  {}", units::human(b.min_storage_size));
        println!("  image-sector-size: {}", b.image_sector_size);
    }
}
