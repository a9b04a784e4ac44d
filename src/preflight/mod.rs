//! Preflight checks for storage commands.
//!
//! Verifies the host has every tool `storage bootable` and `storage wipe`
//! shell out to. Run with `crucible storage preflight`.

mod host_tools;
mod types;

use anyhow::{bail, Result};

use crate::config::BootableConfig;

pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &BootableConfig) -> PreflightReport {
    println!("Checking host tools...\n");
    PreflightReport {
        checks: host_tools::check_host_tools(config),
    }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &BootableConfig) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed() {
        bail!(
            "Preflight failed: {} check(s) failed. Install the missing tools above.",
            report.fail_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
