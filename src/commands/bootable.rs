//! Bootable command - writes a live ISO plus overlay and storage partitions.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crucible::cancel::CancelToken;
use crucible::config::Config;
use crucible::storage::{self, BootableRequest, BuildError};
use crucible::timing::format_duration;

pub struct BootableArgs {
    pub device: PathBuf,
    pub iso: PathBuf,
    pub overlay_size: Option<u64>,
    pub yes: bool,
    pub dry_run: bool,
    pub json: bool,
    pub verify: bool,
}

/// Execute the bootable command.
pub fn cmd_bootable(args: &BootableArgs, config: &Config, cancel: &CancelToken) -> Result<()> {
    let request = BootableRequest {
        device: args.device.clone(),
        iso: args.iso.clone(),
        overlay_size: args.overlay_size,
    };
    let writing = args.yes && !args.dry_run;
    let build = storage::prepare(&request, &config.storage.bootable, writing)
        .map_err(describe)?;

    if args.dry_run {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&build.plan)?);
        } else {
            build.plan.print();
        }
        return Ok(());
    }

    if !writing {
        build.plan.print();
        println!();
        bail!(
            "Refusing to overwrite {} without --yes. All data on it will be destroyed.",
            args.device.display()
        );
    }

    println!("=== Building bootable media ===\n");
    build.plan.print();
    println!();

    let report = build.execute(args.verify, cancel).map_err(describe)?;

    println!();
    println!(
        "Finished preparing bootable. [{}]",
        format_duration(report.elapsed)
    );
    Ok(())
}

/// Put the error kind and stage in front of the error chain.
fn describe(err: BuildError) -> anyhow::Error {
    let headline = match err.stage() {
        Some(stage) => format!("{} at stage {}", err.kind(), stage),
        None => err.kind().to_string(),
    };
    let note = if err.device_modified() {
        "; the device is in an indeterminate state, re-run the whole build"
    } else {
        ""
    };
    anyhow::Error::new(err).context(format!("{headline}{note}"))
}

