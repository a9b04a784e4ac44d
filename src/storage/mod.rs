//! Storage operations: bootable media construction and device wiping.
//!
//! The bootable builder is split so the pure parts can be tested without a
//! device:
//!
//! 1. [`BlockDevice::probe`] and [`SourceImage::inspect`] resolve inputs
//! 2. [`plan_layout`] computes a [`PartitionPlan`] (no side effects)
//! 3. [`write_plan`] drives a [`MediaBackend`] through the build stages
//!
//! [`bootable::prepare`] ties these together for the CLI.

pub mod backend;
pub mod blockdev;
pub mod bootable;
pub mod error;
pub mod iso;
pub mod layout;
pub mod wipe;
pub mod writer;

pub use backend::DeviceBackend;
pub use blockdev::{BlockDevice, DeviceKind, DeviceLock};
pub use bootable::{prepare, BootableRequest, PreparedBuild};
pub use error::BuildError;
pub use iso::{ImageLock, SourceImage};
pub use layout::{plan_layout, LayoutPolicy, Partition, PartitionPlan, PartitionRole};
pub use writer::{write_plan, BuildReport, BuildResult, MediaBackend, Stage};
