//! Source image inspection.
//!
//! Reads just enough of an ISO 9660 image to decide whether it can boot on
//! UEFI firmware: the volume descriptor set starting at sector 16, the
//! El Torito boot record, and the boot catalog it points to.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use fs2::FileExt;
use serde::Serialize;

use super::error::BuildError;

/// ISO 9660 logical sector size.
pub const ISO_SECTOR_SIZE: u64 = 2048;

const DESCRIPTOR_START: u64 = 16;
const MAX_DESCRIPTORS: u64 = 64;
const STANDARD_ID: &[u8; 5] = b"CD001";
const EL_TORITO_ID: &[u8; 23] = b"EL TORITO SPECIFICATION";

const TYPE_BOOT_RECORD: u8 = 0;
const TYPE_PRIMARY: u8 = 1;
const TYPE_TERMINATOR: u8 = 255;

/// El Torito platform ids.
pub const PLATFORM_X86: u8 = 0x00;
pub const PLATFORM_EFI: u8 = 0xEF;

const CATALOG_ENTRY: usize = 32;
const HEADER_MORE: u8 = 0x90;
const HEADER_FINAL: u8 = 0x91;
const EXTENSION: u8 = 0x44;

/// A validated ISO image ready to be copied into the boot partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceImage {
    pub path: PathBuf,
    /// File size in bytes. This is what gets copied.
    pub size: u64,
    pub volume_id: String,
    /// Volume size declared by the primary volume descriptor.
    pub volume_size: u64,
    pub uefi_bootable: bool,
}

impl SourceImage {
    /// Open and validate an ISO file.
    ///
    /// Fails with [`BuildError::InvalidSourceImage`] unless the file is an
    /// ISO 9660 image with a UEFI El Torito entry that is not truncated.
    pub fn inspect(path: &Path) -> Result<Self, BuildError> {
        let invalid = |reason: String| BuildError::InvalidSourceImage {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = File::open(path).map_err(|e| invalid(e.to_string()))?;
        let meta = file.metadata().map_err(|e| invalid(e.to_string()))?;
        if !meta.is_file() {
            return Err(invalid("not a regular file".to_string()));
        }

        let info = read_volume_info(&mut file, meta.len()).map_err(|e| invalid(format!("{e:#}")))?;
        if !info.platforms.contains(&PLATFORM_EFI) {
            return Err(invalid(
                "no UEFI El Torito boot entry (BIOS-only image)".to_string(),
            ));
        }

        tracing::debug!(
            path = %path.display(),
            volume_id = %info.volume_id,
            size = meta.len(),
            "inspected source image"
        );

        Ok(Self {
            path: path.to_path_buf(),
            size: meta.len(),
            volume_id: info.volume_id,
            volume_size: info.volume_size,
            uefi_bootable: true,
        })
    }
}

/// Shared advisory lock on a source image, held from inspection until the
/// build is dropped. Writers that `flock` the image wait until it is released.
#[derive(Debug)]
pub struct ImageLock {
    file: File,
    path: PathBuf,
}

impl ImageLock {
    pub fn acquire(path: &Path) -> Result<Self, BuildError> {
        let invalid = |reason: String| BuildError::InvalidSourceImage {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| invalid(e.to_string()))?;
        if file.try_lock_shared().is_err() {
            return Err(invalid("locked for writing by another process".to_string()));
        }

        tracing::debug!(path = %path.display(), "acquired shared image lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ImageLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), "failed to release image lock: {e}");
        }
    }
}

/// What the descriptor set and boot catalog say about an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub volume_size: u64,
    /// Platform ids of every boot catalog section.
    pub platforms: Vec<u8>,
}

/// Parse the volume descriptors and boot catalog from any seekable reader.
pub fn read_volume_info<R: Read + Seek>(reader: &mut R, len: u64) -> Result<VolumeInfo> {
    ensure!(
        len >= (DESCRIPTOR_START + 1) * ISO_SECTOR_SIZE,
        "file is too small to be an ISO 9660 image"
    );

    let mut primary = None;
    let mut catalog_lba = None;

    for index in 0..MAX_DESCRIPTORS {
        let lba = DESCRIPTOR_START + index;
        if (lba + 1) * ISO_SECTOR_SIZE > len {
            bail!("volume descriptor set is not terminated");
        }
        let sector = read_sector(reader, lba)?;
        if &sector[1..6] != STANDARD_ID {
            if index == 0 {
                bail!("not an ISO 9660 image (no CD001 at sector 16)");
            }
            bail!("corrupt volume descriptor at sector {lba}");
        }

        match sector[0] {
            TYPE_BOOT_RECORD if sector[7..30] == EL_TORITO_ID[..] => {
                catalog_lba = Some(u32::from_le_bytes([
                    sector[71], sector[72], sector[73], sector[74],
                ]) as u64);
            }
            TYPE_PRIMARY if primary.is_none() => {
                let volume_id = String::from_utf8_lossy(&sector[40..72])
                    .trim_end_matches([' ', '\0'])
                    .to_string();
                let blocks =
                    u32::from_le_bytes([sector[80], sector[81], sector[82], sector[83]]) as u64;
                let block_size = u16::from_le_bytes([sector[128], sector[129]]) as u64;
                primary = Some((volume_id, blocks * block_size));
            }
            TYPE_TERMINATOR => break,
            _ => {}
        }
    }

    let (volume_id, volume_size) = primary.context("no primary volume descriptor")?;
    ensure!(
        len >= volume_size,
        "image is truncated: volume declares {volume_size} bytes, file has {len}"
    );

    let catalog_lba = catalog_lba.context("no El Torito boot record; image is not bootable")?;
    ensure!(
        (catalog_lba + 1) * ISO_SECTOR_SIZE <= len,
        "boot catalog at sector {catalog_lba} lies beyond the end of the image"
    );
    let catalog = read_sector(reader, catalog_lba)?;
    let platforms = catalog_platforms(&catalog)?;

    Ok(VolumeInfo {
        volume_id,
        volume_size,
        platforms,
    })
}

fn read_sector<R: Read + Seek>(reader: &mut R, lba: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; ISO_SECTOR_SIZE as usize];
    reader
        .seek(SeekFrom::Start(lba * ISO_SECTOR_SIZE))
        .and_then(|_| reader.read_exact(&mut buf))
        .with_context(|| format!("reading sector {lba}"))?;
    Ok(buf)
}

/// Validate the catalog and collect the platform id of each section.
fn catalog_platforms(catalog: &[u8]) -> Result<Vec<u8>> {
    let validation = &catalog[..CATALOG_ENTRY];
    ensure!(
        validation[0] == 0x01 && validation[30] == 0x55 && validation[31] == 0xAA,
        "boot catalog has no validation entry"
    );
    let sum = validation
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])));
    ensure!(sum == 0, "boot catalog checksum mismatch");

    // The validation entry names the platform of the initial entry.
    let mut platforms = vec![validation[1]];

    let records = catalog.len() / CATALOG_ENTRY;
    let mut index = 2;
    while index < records {
        let record = &catalog[index * CATALOG_ENTRY..(index + 1) * CATALOG_ENTRY];
        match record[0] {
            HEADER_MORE | HEADER_FINAL => {
                platforms.push(record[1]);
                let entries = u16::from_le_bytes([record[2], record[3]]) as usize;
                index += 1;
                let mut seen = 0;
                while seen < entries && index < records {
                    if catalog[index * CATALOG_ENTRY] != EXTENSION {
                        seen += 1;
                    }
                    index += 1;
                }
                if record[0] == HEADER_FINAL {
                    break;
                }
            }
            0x00 if record.iter().all(|b| *b == 0) => break,
            _ => index += 1,
        }
    }

    Ok(platforms)
}
