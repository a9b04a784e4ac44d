//! Layout planning: remainder policy, error boundaries and determinism.
//!
//! Everything here is pure; no devices or files are touched.

use std::path::PathBuf;

use crucible::config::DEFAULT_OVERLAY_SIZE;
use crucible::storage::{
    plan_layout, BlockDevice, BuildError, DeviceKind, LayoutPolicy, PartitionPlan, SourceImage,
};
use crucible::units::{GIB, MIB};

fn device(capacity: u64, sector_size: u64) -> BlockDevice {
    BlockDevice::new("/dev/sdz", capacity, sector_size, DeviceKind::BlockDevice).unwrap()
}

fn image(size: u64) -> SourceImage {
    SourceImage {
        path: PathBuf::from("/srv/live.iso"),
        size,
        volume_id: "LIVE".to_string(),
        volume_size: size,
        uefi_bootable: true,
    }
}

fn plan(capacity: u64, image_size: u64, overlay: Option<u64>) -> Result<PartitionPlan, BuildError> {
    plan_layout(
        &device(capacity, 512),
        &image(image_size),
        overlay,
        &LayoutPolicy::default(),
    )
}

/// Sum of every extent in bytes.
fn covered_bytes(plan: &PartitionPlan) -> u64 {
    plan.extents().iter().map(|e| e.sectors).sum::<u64>() * plan.sector_size
}

// =============================================================================
// Reference scenarios
// =============================================================================

#[test]
fn test_64g_device_4g_image_8g_overlay() {
    let plan = plan(64 * GIB, 4 * GIB, Some(8 * GIB)).unwrap();
    let ss = plan.sector_size;

    assert_eq!(plan.boot.size_bytes(ss), 4 * GIB);
    assert_eq!(plan.overlay.size_bytes(ss), 8 * GIB);

    // 52 GiB less the primary reservation and the backup GPT.
    let metadata = (plan.primary_gpt.sectors + plan.backup_gpt.sectors) * ss;
    assert_eq!(plan.storage.size_bytes(ss), 52 * GIB - metadata);

    assert_eq!(covered_bytes(&plan), 64 * GIB);
    plan.verify().unwrap();
}

#[test]
fn test_8g_device_4g_image_8g_overlay_is_too_large() {
    match plan(8 * GIB, 4 * GIB, Some(8 * GIB)) {
        Err(BuildError::OverlayTooLarge { requested, available }) => {
            assert_eq!(requested, 8 * GIB);
            assert!(available < 4 * GIB);
        }
        other => panic!("expected OverlayTooLarge, got {other:?}"),
    }
}

#[test]
fn test_default_overlay_leaves_exact_remainder() {
    let plan = plan(64 * GIB, 4 * GIB, None).unwrap();
    let ss = plan.sector_size;

    assert!(plan.overlay_defaulted);
    assert_eq!(plan.overlay.size_bytes(ss), DEFAULT_OVERLAY_SIZE);

    let fixed = plan.fixed_sectors() * ss;
    assert_eq!(
        plan.storage.size_bytes(ss),
        64 * GIB - fixed - DEFAULT_OVERLAY_SIZE
    );
}

#[test]
fn test_default_overlay_follows_policy() {
    let policy = LayoutPolicy {
        default_overlay_size: 2 * GIB,
        ..LayoutPolicy::default()
    };
    let plan = plan_layout(&device(16 * GIB, 512), &image(GIB), None, &policy).unwrap();
    assert_eq!(plan.overlay.size_bytes(512), 2 * GIB);
    assert_eq!(plan.requested_overlay_size, 2 * GIB);
}

#[test]
fn test_plans_are_deterministic() {
    let a = plan(64 * GIB, 4 * GIB, Some(8 * GIB)).unwrap();
    let b = plan(64 * GIB, 4 * GIB, Some(8 * GIB)).unwrap();
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_vec(&a).unwrap(),
        serde_json::to_vec(&b).unwrap()
    );
    assert_eq!(a.to_sfdisk_script(), b.to_sfdisk_script());
}

// =============================================================================
// Error boundaries
// =============================================================================

#[test]
fn test_zero_capacity_is_insufficient() {
    assert!(matches!(
        plan(0, 4 * GIB, Some(GIB)),
        Err(BuildError::InsufficientCapacity { .. })
    ));
}

#[test]
fn test_image_larger_than_device_is_insufficient() {
    match plan(2 * GIB, 4 * GIB, Some(MIB)) {
        Err(BuildError::InsufficientCapacity {
            capacity, required, ..
        }) => {
            assert_eq!(capacity, 2 * GIB);
            assert!(required > 4 * GIB);
        }
        other => panic!("expected InsufficientCapacity, got {other:?}"),
    }
}

#[test]
fn test_empty_image_is_invalid() {
    assert!(matches!(
        plan(64 * GIB, 0, Some(GIB)),
        Err(BuildError::InvalidSourceImage { .. })
    ));
}

#[test]
fn test_overlay_filling_everything_is_too_large() {
    // Overlay that would consume exactly the remaining usable sectors.
    let base = plan(16 * GIB, GIB, Some(MIB)).unwrap();
    let remaining = base.overlay.size_bytes(512) + base.storage.size_bytes(512);
    assert!(matches!(
        plan(16 * GIB, GIB, Some(remaining)),
        Err(BuildError::OverlayTooLarge { .. })
    ));
}

#[test]
fn test_storage_absorbs_unaligned_tail() {
    let base = plan(16 * GIB, GIB, Some(MIB)).unwrap();
    let remaining = base.overlay.sectors + base.storage.sectors;
    // Largest aligned overlay that still leaves at least 1 MiB of storage.
    let overlay_sectors = (remaining - 2048) / 2048 * 2048;
    let plan = plan(16 * GIB, GIB, Some(overlay_sectors * 512)).unwrap();

    assert_eq!(plan.overlay.sectors, overlay_sectors);
    assert_eq!(plan.storage.sectors, remaining - overlay_sectors);
    assert!(plan.storage.sectors >= 2048 && plan.storage.sectors < 4096);
    assert_eq!(plan.storage.end_lba(), plan.last_usable_lba);
    plan.verify().unwrap();
}

// =============================================================================
// Invariants over a sweep of inputs
// =============================================================================

#[test]
fn test_sum_and_contiguity_over_sweep() {
    let capacities = [GIB, 8 * GIB, 32 * GIB, 64 * GIB, 500 * GIB, 931 * GIB + 512 * MIB];
    let images = [MIB, 700 * MIB + 12_345 * 2, 2 * GIB, 4 * GIB];
    let overlays = [None, Some(MIB), Some(3 * GIB + 7), Some(8 * GIB), Some(60 * GIB)];

    for sector_size in [512, 4096] {
        for &capacity in &capacities {
            for &image_size in &images {
                for &overlay in &overlays {
                    let result = plan_layout(
                        &device(capacity, sector_size),
                        &image(image_size),
                        overlay,
                        &LayoutPolicy::default(),
                    );
                    match result {
                        Ok(plan) => {
                            plan.verify().unwrap();
                            assert_eq!(covered_bytes(&plan), capacity);
                            assert!(plan.boot.size_bytes(sector_size) >= image_size);
                            if let Some(requested) = overlay {
                                assert!(plan.overlay.size_bytes(sector_size) >= requested);
                            }
                            assert!(plan.storage.sectors >= 1);
                        }
                        Err(BuildError::InsufficientCapacity { .. })
                        | Err(BuildError::OverlayTooLarge { .. })
                        | Err(BuildError::StoragePartitionTooSmall { .. }) => {
                            // Only alignment padding separates a failure from a fit.
                            let requested = overlay.unwrap_or(DEFAULT_OVERLAY_SIZE);
                            assert!(capacity <= image_size + requested + 5 * MIB);
                        }
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                }
            }
        }
    }
}

#[test]
fn test_4k_sector_reference_layout() {
    let plan = plan_layout(
        &device(64 * GIB, 4096),
        &image(4 * GIB),
        Some(8 * GIB),
        &LayoutPolicy::default(),
    )
    .unwrap();
    assert_eq!(plan.sector_size, 4096);
    assert_eq!(plan.boot.size_bytes(4096), 4 * GIB);
    assert_eq!(covered_bytes(&plan), 64 * GIB);
    plan.verify().unwrap();
}

#[test]
fn test_labels_and_types_from_policy() {
    let policy = LayoutPolicy {
        overlay_label: "persist".to_string(),
        storage_label: "vmstore".to_string(),
        ..LayoutPolicy::default()
    };
    let plan = plan_layout(&device(64 * GIB, 512), &image(GIB), Some(GIB), &policy).unwrap();
    let labels: Vec<_> = plan.partitions().iter().map(|p| p.label.as_str()).collect();
    assert_eq!(labels, ["BOOT", "persist", "vmstore"]);
    assert!(plan.boot.filesystem.is_none());
    assert!(plan.to_sfdisk_script().contains("name=\"vmstore\""));
}
