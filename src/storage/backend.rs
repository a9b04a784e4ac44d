//! The production [`MediaBackend`]: util-linux, e2fsprogs/xfsprogs and
//! coreutils driven through [`Cmd`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use sha2::{Digest, Sha256};

use crate::config::Filesystem;
use crate::process::{self, Cmd};

use super::blockdev::BlockDevice;
use super::iso::SourceImage;
use super::layout::{Partition, PartitionPlan};
use super::writer::MediaBackend;

/// We already hold a `flock` on the device; util-linux would otherwise wait
/// on it forever.
const LOCK_ENV: &str = "LOCK_BLOCK_DEVICE";

/// dd block size for the image copy.
const COPY_BLOCK_SIZE: &str = "4M";

pub struct DeviceBackend {
    device: BlockDevice,
    verify: bool,
}

impl DeviceBackend {
    pub fn new(device: BlockDevice) -> Self {
        Self {
            device,
            verify: false,
        }
    }

    /// Read the boot partition back after copying and compare SHA-256.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    fn path(&self) -> &Path {
        self.device.path()
    }

    fn sfdisk(&self) -> Cmd {
        let mut cmd = Cmd::new("sfdisk").env(LOCK_ENV, "0");
        if !self.device.is_block_device() && self.device.sector_size() != 512 {
            cmd = cmd
                .arg("--sector-size")
                .arg(self.device.sector_size().to_string());
        }
        cmd
    }

    fn partition_node(&self, part: &Partition) -> Result<PathBuf> {
        self.device
            .partition_path(part.number)
            .with_context(|| format!("{} has no partition nodes", self.path().display()))
    }

    /// Wait for udev and make sure every partition node exists.
    fn wait_for_partitions(&self, plan: &PartitionPlan) -> Result<()> {
        let settle = || {
            if process::exists("udevadm") {
                let _ = Cmd::new("udevadm").arg("settle").allow_fail().run();
            }
        };
        settle();

        let missing = |plan: &PartitionPlan| -> Vec<PathBuf> {
            plan.partitions()
                .iter()
                .filter_map(|p| self.device.partition_path(p.number))
                .filter(|node| !node.exists())
                .collect()
        };

        if !missing(plan).is_empty() {
            tracing::debug!("partition nodes missing, asking the kernel to re-read");
            Cmd::new("partx")
                .arg("--update")
                .arg_path(self.path())
                .env(LOCK_ENV, "0")
                .allow_fail()
                .run()?;
            settle();
        }

        let still_missing = missing(plan);
        ensure!(
            still_missing.is_empty(),
            "partition nodes did not appear: {}",
            still_missing
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    fn format_one(&self, part: &Partition, fs: Filesystem, sector_size: u64) -> Result<()> {
        println!("  Creating {} filesystem '{}'...", fs, part.label);

        if self.device.is_block_device() {
            let node = self.partition_node(part)?;
            let force = match fs {
                Filesystem::Ext4 => "-F",
                Filesystem::Xfs => "-f",
            };
            Cmd::new(fs.mkfs())
                .args([force, "-q", "-L", part.label.as_str()])
                .arg_path(&node)
                .error_msg(format!("{} failed on {}", fs.mkfs(), node.display()))
                .run()?;
            return Ok(());
        }

        // Image files have no partition nodes; mke2fs can address a byte
        // offset directly.
        match fs {
            Filesystem::Ext4 => {
                let offset = part.offset_bytes(sector_size);
                let kib = part.size_bytes(sector_size) / 1024;
                Cmd::new(fs.mkfs())
                    .args(["-F", "-q", "-L", part.label.as_str(), "-E"])
                    .arg(format!("offset={offset}"))
                    .arg_path(self.path())
                    .arg(format!("{kib}k"))
                    .error_msg(format!("{} failed for partition {}", fs.mkfs(), part.number))
                    .run()?;
                Ok(())
            }
            Filesystem::Xfs => bail!(
                "xfs cannot be created inside an image file; use ext4 or a block device"
            ),
        }
    }

    fn verify_copy(&self, plan: &PartitionPlan, image: &SourceImage) -> Result<()> {
        println!("  Verifying boot partition...");
        let expected = sha256_file(&image.path, image.size)?;

        let mut target = File::open(self.path())
            .with_context(|| format!("opening {} for verification", self.path().display()))?;
        target.seek(SeekFrom::Start(plan.boot.offset_bytes(plan.sector_size)))?;
        let actual = sha256_reader(&mut target, image.size)?;

        ensure!(
            expected == actual,
            "boot partition does not match the image (expected sha256 {expected}, found {actual})"
        );
        tracing::debug!(sha256 = %actual, "boot partition verified");
        Ok(())
    }
}

impl MediaBackend for DeviceBackend {
    fn write_gpt(&mut self, plan: &PartitionPlan) -> Result<()> {
        println!("  Wiping signatures on {}...", self.path().display());
        Cmd::new("wipefs")
            .args(["--all", "--force"])
            .arg_path(self.path())
            .env(LOCK_ENV, "0")
            .error_msg("wipefs failed")
            .run()?;

        println!("  Writing protective MBR and GPT header...");
        self.sfdisk()
            .args(["--quiet", "--wipe", "always"])
            .arg_path(self.path())
            .stdin_data(plan.empty_table_script())
            .error_msg("sfdisk failed to write GPT")
            .run()?;
        Ok(())
    }

    fn create_partitions(&mut self, plan: &PartitionPlan) -> Result<()> {
        println!("  Creating {} partitions...", plan.partitions().len());
        self.sfdisk()
            .args(["--quiet", "--wipe", "always", "--wipe-partitions", "always"])
            .arg_path(self.path())
            .stdin_data(plan.to_sfdisk_script())
            .error_msg("sfdisk failed to create partitions")
            .run()?;

        if self.device.is_block_device() {
            self.wait_for_partitions(plan)?;
        }
        Ok(())
    }

    fn format_partitions(&mut self, plan: &PartitionPlan) -> Result<()> {
        for part in [&plan.overlay, &plan.storage] {
            if let Some(fs) = part.filesystem {
                self.format_one(part, fs, plan.sector_size)?;
            }
        }
        Ok(())
    }

    fn copy_image(&mut self, plan: &PartitionPlan, image: &SourceImage) -> Result<()> {
        println!(
            "Writing [{}] to [{}]",
            image.path.display(),
            self.path().display()
        );

        let current = std::fs::metadata(&image.path)
            .with_context(|| format!("reading {}", image.path.display()))?
            .len();
        ensure!(
            current >= image.size,
            "{} shrank from {} to {} bytes since planning",
            image.path.display(),
            image.size,
            current
        );
        if current > image.size {
            tracing::warn!(
                path = %image.path.display(),
                planned = image.size,
                current,
                "source image grew since planning; copying the planned size only"
            );
        }

        // Never write past the planned image size, whatever the file holds now.
        let cmd = Cmd::new("dd")
            .arg(format!("if={}", image.path.display()))
            .arg(format!("bs={COPY_BLOCK_SIZE}"))
            .arg(format!("count={}", image.size))
            .arg("iflag=count_bytes")
            .arg("status=none");
        let cmd = if self.device.is_block_device() {
            let node = self.partition_node(&plan.boot)?;
            cmd.arg(format!("of={}", node.display()))
                .arg("conv=fsync")
        } else {
            cmd.arg(format!("of={}", self.path().display()))
                .arg("conv=fsync,notrunc")
                .arg("oflag=seek_bytes")
                .arg(format!("seek={}", plan.boot.offset_bytes(plan.sector_size)))
        };
        cmd.error_msg("dd failed to copy the image").run()?;

        if self.verify {
            self.verify_copy(plan, image)?;
        }
        Ok(())
    }

    fn write_backup_gpt(&mut self, _plan: &PartitionPlan) -> Result<()> {
        println!("  Writing backup GPT...");
        self.sfdisk()
            .args(["--quiet", "--relocate", "gpt-bak-std"])
            .arg_path(self.path())
            .error_msg("sfdisk failed to place the backup GPT")
            .run()?;
        self.sfdisk()
            .arg("--verify")
            .arg_path(self.path())
            .error_msg("partition table failed verification")
            .run()?;

        let file = OpenOptions::new()
            .write(true)
            .open(self.path())
            .with_context(|| format!("opening {} to flush", self.path().display()))?;
        file.sync_all().context("flushing device")?;

        if self.device.is_block_device() {
            Cmd::new("blockdev")
                .arg("--flushbufs")
                .arg_path(self.path())
                .error_msg("blockdev --flushbufs failed")
                .run()?;
        }
        Ok(())
    }
}

fn sha256_file(path: &Path, limit: u64) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    sha256_reader(&mut file, limit)
}

/// SHA-256 of the next `limit` bytes of `reader`, hex encoded.
fn sha256_reader<R: Read>(reader: &mut R, limit: u64) -> Result<String> {
    let mut hasher = Sha256::new();
    let copied = std::io::copy(&mut reader.take(limit), &mut hasher).context("hashing")?;
    ensure!(copied == limit, "short read: {copied} of {limit} bytes");
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_sha256_reader_limits() {
        let data = b"abcdefgh".to_vec();
        let full = sha256_reader(&mut Cursor::new(&data), 3).unwrap();
        let prefix = sha256_reader(&mut Cursor::new(b"abc".to_vec()), 3).unwrap();
        assert_eq!(full, prefix);
        assert_eq!(
            prefix,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_reader_short() {
        assert!(sha256_reader(&mut Cursor::new(b"ab".to_vec()), 3).is_err());
    }
}
