//! Host tool availability checks.

use crate::config::{BootableConfig, Filesystem};
use crate::process::{self, Cmd};

use super::types::CheckResult;

/// (tool, package, purpose)
const REQUIRED_TOOLS: [(&str, &str, &str); 6] = [
    ("sfdisk", "util-linux", "Writes the GPT and partition entries"),
    ("wipefs", "util-linux", "Clears old signatures"),
    ("lsblk", "util-linux", "Reads block device geometry"),
    ("blockdev", "util-linux", "Flushes and re-reads block devices"),
    ("dd", "coreutils", "Copies the ISO to the boot partition"),
    ("mkfs.ext4", "e2fsprogs", "Creates ext4 overlay/storage filesystems"),
];

/// First util-linux release whose sfdisk takes `--sector-size`.
const SFDISK_SECTOR_SIZE_SINCE: (u32, u32) = (2, 39);

const OPTIONAL_TOOLS: [(&str, &str, &str); 2] = [
    ("udevadm", "systemd-udev", "Waits for partition device nodes"),
    ("partx", "util-linux", "Re-reads partition tables when udev is slow"),
];

/// Check host tools against the configured filesystems.
pub fn check_host_tools(config: &BootableConfig) -> Vec<CheckResult> {
    let mut results: Vec<_> = REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, true))
        .collect();

    let wants_xfs =
        config.overlay_fs == Filesystem::Xfs || config.storage_fs == Filesystem::Xfs;
    results.push(check_tool_exists(
        Filesystem::Xfs.mkfs(),
        "xfsprogs",
        "Creates xfs filesystems (configured)",
        wants_xfs,
    ));

    if config.image_sector_size != 512 {
        results.push(check_sfdisk_sector_size(config.image_sector_size));
    }

    results.extend(
        OPTIONAL_TOOLS
            .iter()
            .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose, false)),
    );
    results
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass(tool, &path.display().to_string()),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            if required {
                CheckResult::fail(tool, &msg)
            } else {
                CheckResult::warn(tool, &msg)
            }
        }
    }
}

/// Image files with non-512 sectors need `sfdisk --sector-size`.
fn check_sfdisk_sector_size(sector_size: u64) -> CheckResult {
    let name = "sfdisk --sector-size";
    let version = Cmd::new("sfdisk")
        .arg("--version")
        .allow_fail()
        .run()
        .ok()
        .and_then(|r| parse_util_linux_version(&r.stdout));
    let (major, minor) = SFDISK_SECTOR_SIZE_SINCE;

    match version {
        Some(found) if found >= SFDISK_SECTOR_SIZE_SINCE => {
            CheckResult::pass(name, &format!("util-linux {}.{}", found.0, found.1))
        }
        Some(found) => CheckResult::warn(
            name,
            &format!(
                "util-linux {}.{} is too old for {sector_size}-byte image files (needs {major}.{minor})",
                found.0, found.1
            ),
        ),
        None => CheckResult::warn(
            name,
            &format!("Could not read the sfdisk version; {sector_size}-byte image files need util-linux {major}.{minor}"),
        ),
    }
}

/// `sfdisk from util-linux 2.38.1` -> `(2, 38)`.
fn parse_util_linux_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().last()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    let minor = minor.parse().ok()?;
    Some((major, minor))
}
