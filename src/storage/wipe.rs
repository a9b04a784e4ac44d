//! `storage wipe`: return a device to a blank state.
//!
//! Removes every filesystem and partition-table signature wipefs knows about,
//! then zeroes the first MiB and the backup GPT region so no stale table can
//! be recovered by firmware or partitioning tools.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use anyhow::{Context, Result};

use crate::process::Cmd;
use crate::units::MIB;

use super::blockdev::{BlockDevice, DeviceLock};
use super::layout::entry_array_sectors;

const LOCK_ENV: &str = "LOCK_BLOCK_DEVICE";

/// Byte ranges zeroed by [`wipe_device`], clamped to the device.
pub fn zero_ranges(device: &BlockDevice) -> Vec<(u64, u64)> {
    let capacity = device.capacity();
    let head = MIB.min(capacity);
    let tail_len = (entry_array_sectors(device.sector_size()) + 1) * device.sector_size();
    let tail_start = capacity.saturating_sub(tail_len).max(head);

    let mut ranges = vec![(0, head)];
    if tail_start < capacity {
        ranges.push((tail_start, capacity - tail_start));
    }
    ranges
}

/// Wipe `device`. The caller must hold `lock` on the same device.
pub fn wipe_device(device: &BlockDevice, lock: &DeviceLock) -> Result<()> {
    println!("Wiping {} ...", device.path().display());

    Cmd::new("wipefs")
        .args(["--all", "--force"])
        .arg_path(device.path())
        .env(LOCK_ENV, "0")
        .error_msg("wipefs failed")
        .run()?;

    let mut file = OpenOptions::new()
        .write(true)
        .open(lock.path())
        .with_context(|| format!("opening {}", device.path().display()))?;
    let zeros = vec![0u8; MIB as usize];
    for (offset, len) in zero_ranges(device) {
        tracing::debug!(offset, len, "zeroing");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&zeros[..len as usize])
            .with_context(|| format!("zeroing {len} bytes at {offset}"))?;
    }
    file.sync_all().context("flushing device")?;

    if device.is_block_device() {
        Cmd::new("blockdev")
            .arg("--rereadpt")
            .arg_path(device.path())
            .allow_fail()
            .run()?;
    }

    println!("Finished wiping {}.", device.path().display());
    Ok(())
}
