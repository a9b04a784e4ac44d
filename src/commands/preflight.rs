//! Preflight command - runs host tool checks.

use anyhow::Result;

use crucible::config::Config;
use crucible::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &Config, strict: bool) -> Result<()> {
    let bootable = &config.storage.bootable;
    if strict {
        preflight::run_preflight_or_fail(bootable)?;
    } else {
        let report = preflight::run_preflight(bootable);
        report.print();
        if !report.all_passed() {
            println!("Some checks failed. Use --strict to exit non-zero.");
        }
    }
    Ok(())
}
