//! CLI command handlers.
//!
//! Each submodule handles one `storage` command:
//! - `bootable` - Build bootable media
//! - `wipe` - Wipe a device
//! - `preflight` - Check host tools

mod bootable;
mod preflight;
mod wipe;

pub use bootable::{cmd_bootable, BootableArgs};
pub use preflight::cmd_preflight;
pub use wipe::cmd_wipe;
