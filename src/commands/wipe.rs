//! Wipe command - clears partition tables and signatures from a device.

use anyhow::{bail, Result};
use std::path::Path;

use crucible::config::Config;
use crucible::storage::{wipe, BlockDevice, DeviceLock};
use crucible::units::human;

/// Execute the wipe command.
pub fn cmd_wipe(device: &Path, yes: bool, config: &Config) -> Result<()> {
    let device = BlockDevice::probe(device, config.storage.bootable.image_sector_size)?;

    if !yes {
        println!(
            "Would wipe {} ({}{})",
            device.path().display(),
            human(device.capacity()),
            device
                .model()
                .map(|m| format!(", {m}"))
                .unwrap_or_default()
        );
        bail!("Refusing to wipe without --yes.");
    }

    let lock = DeviceLock::acquire(&device)?;
    if let Err(e) = wipe::wipe_device(&device, &lock) {
        tracing::error!("wipe failed: {e:#}");
        bail!(
            "Failed to wipe {}! Verify `lsblk` output.\n{e:#}",
            device.path().display()
        );
    }
    Ok(())
}
