//! Shared test utilities for crucible tests.

#![allow(dead_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crucible::storage::iso::ISO_SECTOR_SIZE;

/// Temporary directory holding test images. Removed on drop.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub dir: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();
        Self {
            _temp_dir: temp_dir,
            dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create a sparse disk image of `size` bytes.
    pub fn disk_image(&self, name: &str, size: u64) -> PathBuf {
        let path = self.path(name);
        let file = File::create(&path).expect("Failed to create disk image");
        file.set_len(size).expect("Failed to size disk image");
        path
    }

    /// Write a synthetic ISO described by `spec`.
    pub fn iso(&self, name: &str, spec: &IsoSpec) -> PathBuf {
        let path = self.path(name);
        write_iso(&path, spec);
        path
    }
}

/// Shape of a synthetic ISO 9660 image.
#[derive(Debug, Clone)]
pub struct IsoSpec {
    pub volume_id: &'static str,
    /// File size in bytes (multiple of 2048).
    pub size: u64,
    /// Add an El Torito section for platform 0xEF.
    pub uefi: bool,
    /// Add an El Torito boot record at all.
    pub el_torito: bool,
    /// Volume size written to the PVD. Defaults to `size`.
    pub declared_size: Option<u64>,
}

impl Default for IsoSpec {
    fn default() -> Self {
        Self {
            volume_id: "CRUCIBLE_LIVE",
            size: 64 * 1024,
            uefi: true,
            el_torito: true,
            declared_size: None,
        }
    }
}

const CATALOG_LBA: u64 = 19;

fn descriptor(kind: u8) -> Vec<u8> {
    let mut sector = vec![0u8; ISO_SECTOR_SIZE as usize];
    sector[0] = kind;
    sector[1..6].copy_from_slice(b"CD001");
    sector[6] = 1;
    sector
}

fn validation_entry() -> [u8; 32] {
    let mut entry = [0u8; 32];
    entry[0] = 0x01;
    entry[1] = 0x00;
    entry[30] = 0x55;
    entry[31] = 0xAA;
    let sum = entry
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_le_bytes([w[0], w[1]])));
    entry[28..30].copy_from_slice(&0u16.wrapping_sub(sum).to_le_bytes());
    entry
}

/// Write a minimal ISO: boot record at 16, PVD at 17, terminator at 18 and
/// the boot catalog at 19.
pub fn write_iso(path: &Path, spec: &IsoSpec) {
    assert!(spec.size % ISO_SECTOR_SIZE == 0 && spec.size >= 20 * ISO_SECTOR_SIZE);

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .expect("Failed to create ISO");
    file.set_len(spec.size).unwrap();

    let mut sectors = Vec::new();

    if spec.el_torito {
        let mut boot = descriptor(0);
        boot[7..30].copy_from_slice(b"EL TORITO SPECIFICATION");
        boot[71..75].copy_from_slice(&(CATALOG_LBA as u32).to_le_bytes());
        sectors.push(boot);
    }

    let mut pvd = descriptor(1);
    let mut volume_id = [b' '; 32];
    volume_id[..spec.volume_id.len()].copy_from_slice(spec.volume_id.as_bytes());
    pvd[40..72].copy_from_slice(&volume_id);
    let blocks = (spec.declared_size.unwrap_or(spec.size) / ISO_SECTOR_SIZE) as u32;
    pvd[80..84].copy_from_slice(&blocks.to_le_bytes());
    pvd[84..88].copy_from_slice(&blocks.to_be_bytes());
    pvd[128..130].copy_from_slice(&(ISO_SECTOR_SIZE as u16).to_le_bytes());
    sectors.push(pvd);

    sectors.push(descriptor(255));

    for (i, sector) in sectors.iter().enumerate() {
        file.seek(SeekFrom::Start((16 + i as u64) * ISO_SECTOR_SIZE))
            .unwrap();
        file.write_all(sector).unwrap();
    }

    if spec.el_torito {
        let mut catalog = vec![0u8; ISO_SECTOR_SIZE as usize];
        catalog[..32].copy_from_slice(&validation_entry());
        catalog[32] = 0x88;
        if spec.uefi {
            catalog[64] = 0x91;
            catalog[65] = 0xEF;
            catalog[66..68].copy_from_slice(&1u16.to_le_bytes());
            catalog[96] = 0x88;
        }
        file.seek(SeekFrom::Start(CATALOG_LBA * ISO_SECTOR_SIZE))
            .unwrap();
        file.write_all(&catalog).unwrap();
    }

    // Recognisable payload so copies can be checked.
    file.seek(SeekFrom::Start(20 * ISO_SECTOR_SIZE)).unwrap();
    file.write_all(b"crucible test payload").unwrap();
    file.sync_all().unwrap();
}

/// True if every tool is on PATH.
pub fn tools_available(tools: &[&str]) -> bool {
    tools.iter().all(|t| crucible::process::exists(t))
}

/// Read a whole file, for content assertions.
pub fn read(path: &Path) -> Vec<u8> {
    fs::read(path).expect("Failed to read file")
}
