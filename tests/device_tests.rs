//! Device probing, locking and build preparation on disk image files.

mod helpers;

use crucible::config::{BootableConfig, Filesystem};
use crucible::storage::{
    self, BlockDevice, BootableRequest, BuildError, DeviceBackend, DeviceKind, DeviceLock,
    MediaBackend,
};
use crucible::units::MIB;
use fs2::FileExt;
use helpers::{IsoSpec, TestEnv};
use std::fs::{self, File, OpenOptions};
use std::io::Write;

// =============================================================================
// Probing
// =============================================================================

#[test]
fn test_probe_image_file() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);

    let device = BlockDevice::probe(&disk, 512).unwrap();
    assert_eq!(device.kind(), DeviceKind::ImageFile);
    assert_eq!(device.capacity(), 256 * MIB);
    assert_eq!(device.sector_size(), 512);
    assert_eq!(device.total_sectors(), 524_288);
    assert!(device.partition_path(1).is_none());
}

#[test]
fn test_probe_image_file_with_4k_sectors() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let device = BlockDevice::probe(&disk, 4096).unwrap();
    assert_eq!(device.total_sectors(), 65_536);
}

#[test]
fn test_probe_rejects_partial_sector_file() {
    let env = TestEnv::new();
    let disk = env.disk_image("odd.img", 256 * MIB + 100);
    assert!(matches!(
        BlockDevice::probe(&disk, 512),
        Err(BuildError::InvalidDevice { .. })
    ));
}

#[test]
fn test_probe_rejects_missing_and_directories() {
    let env = TestEnv::new();
    assert!(matches!(
        BlockDevice::probe(&env.path("nope.img"), 512),
        Err(BuildError::InvalidDevice { .. })
    ));
    assert!(matches!(
        BlockDevice::probe(&env.dir, 512),
        Err(BuildError::InvalidDevice { .. })
    ));
}

// =============================================================================
// Locking
// =============================================================================

#[test]
fn test_second_lock_is_busy() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 64 * MIB);
    let device = BlockDevice::probe(&disk, 512).unwrap();

    let first = DeviceLock::acquire(&device).unwrap();
    match DeviceLock::acquire(&device) {
        Err(BuildError::DeviceBusy { device: path }) => assert_eq!(path, disk),
        other => panic!("expected DeviceBusy, got {other:?}"),
    }

    drop(first);
    DeviceLock::acquire(&device).unwrap();
}

// =============================================================================
// Preparation (probe + lock + inspect + plan)
// =============================================================================

fn request(disk: &std::path::Path, iso: &std::path::Path, overlay: Option<u64>) -> BootableRequest {
    BootableRequest {
        device: disk.to_path_buf(),
        iso: iso.to_path_buf(),
        overlay_size: overlay,
    }
}

#[test]
fn test_prepare_plans_image_file() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());

    let build = storage::prepare(
        &request(&disk, &iso, Some(64 * MIB)),
        &BootableConfig::default(),
        false,
    )
    .unwrap();

    assert!(!build.is_locked());
    assert_eq!(build.plan.device, disk);
    assert_eq!(build.plan.boot.size_bytes(512), MIB);
    assert_eq!(build.plan.overlay.size_bytes(512), 64 * MIB);
    let covered: u64 = build.plan.extents().iter().map(|e| e.sectors).sum();
    assert_eq!(covered * 512, 256 * MIB);
}

#[test]
fn test_prepare_holds_lock_until_dropped() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let config = BootableConfig::default();
    let req = request(&disk, &iso, Some(64 * MIB));

    let build = storage::prepare(&req, &config, true).unwrap();
    assert!(build.is_locked());
    assert!(matches!(
        storage::prepare(&req, &config, true),
        Err(BuildError::DeviceBusy { .. })
    ));

    drop(build);
    storage::prepare(&req, &config, true).unwrap();
}

#[test]
fn test_prepare_default_overlay_too_large_for_small_disk() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());

    // The default overlay is 50,000 MiB.
    assert!(matches!(
        storage::prepare(&request(&disk, &iso, None), &BootableConfig::default(), false),
        Err(BuildError::OverlayTooLarge { .. })
    ));
}

#[test]
fn test_prepare_rejects_bios_only_iso() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso(
        "bios.iso",
        &IsoSpec {
            uefi: false,
            ..IsoSpec::default()
        },
    );
    assert!(matches!(
        storage::prepare(
            &request(&disk, &iso, Some(MIB)),
            &BootableConfig::default(),
            false
        ),
        Err(BuildError::InvalidSourceImage { .. })
    ));
}

#[test]
fn test_prepare_rejects_xfs_on_image_file() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let config = BootableConfig {
        storage_fs: Filesystem::Xfs,
        ..BootableConfig::default()
    };
    assert!(matches!(
        storage::prepare(&request(&disk, &iso, Some(MIB)), &config, false),
        Err(BuildError::InvalidDevice { .. })
    ));
}

#[test]
fn test_execute_requires_lock() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let build = storage::prepare(
        &request(&disk, &iso, Some(MIB)),
        &BootableConfig::default(),
        false,
    )
    .unwrap();

    let err = build
        .execute(false, &crucible::cancel::CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, BuildError::InvalidDevice { .. }));
    // Nothing was written.
    assert!(fs::read(&disk).unwrap().iter().all(|b| *b == 0));
}

#[test]
fn test_prepare_holds_shared_image_lock() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let req = request(&disk, &iso, Some(64 * MIB));

    let build = storage::prepare(&req, &BootableConfig::default(), true).unwrap();
    let writer = File::open(&iso).unwrap();
    assert!(writer.try_lock_exclusive().is_err());

    drop(build);
    writer.try_lock_exclusive().unwrap();
    // An image being written elsewhere is refused.
    assert!(matches!(
        storage::prepare(&req, &BootableConfig::default(), true),
        Err(BuildError::InvalidSourceImage { .. })
    ));
}

// =============================================================================
// Image copy (dd only, no partition table needed)
// =============================================================================

#[test]
fn test_copy_image_writes_only_the_planned_size() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let build = storage::prepare(
        &request(&disk, &iso, Some(64 * MIB)),
        &BootableConfig::default(),
        false,
    )
    .unwrap();
    let original = fs::read(&iso).unwrap();

    // The image grows after planning.
    let mut file = OpenOptions::new().append(true).open(&iso).unwrap();
    file.write_all(&vec![0xAA; 2 * MIB as usize]).unwrap();
    drop(file);

    let mut backend = DeviceBackend::new(build.device.clone()).verify(true);
    backend.copy_image(&build.plan, &build.image).unwrap();

    let bytes = fs::read(&disk).unwrap();
    let plan = &build.plan;
    let boot = plan.boot.offset_bytes(512) as usize;
    let boot_end = boot + plan.boot.size_bytes(512) as usize;
    assert_eq!(&bytes[boot..boot + original.len()], &original[..]);
    assert!(bytes[boot + original.len()..boot_end].iter().all(|b| *b == 0));

    let overlay = plan.overlay.offset_bytes(512) as usize;
    let overlay_end = overlay + plan.overlay.size_bytes(512) as usize;
    assert!(bytes[overlay..overlay_end].iter().all(|b| *b == 0));
}

#[test]
fn test_copy_image_rejects_shrunk_image() {
    let env = TestEnv::new();
    let disk = env.disk_image("disk.img", 256 * MIB);
    let iso = env.iso("live.iso", &IsoSpec::default());
    let build = storage::prepare(
        &request(&disk, &iso, Some(64 * MIB)),
        &BootableConfig::default(),
        false,
    )
    .unwrap();

    OpenOptions::new()
        .write(true)
        .open(&iso)
        .unwrap()
        .set_len(build.image.size / 2)
        .unwrap();

    let mut backend = DeviceBackend::new(build.device.clone());
    let err = backend.copy_image(&build.plan, &build.image).unwrap_err();
    assert!(err.to_string().contains("shrank"));
    assert!(fs::read(&disk).unwrap().iter().all(|b| *b == 0));
}
