//! crucible - hyper-converged infrastructure management.
//!
//! Storage tooling for bare-metal nodes:
//! - `storage bootable` writes a live ISO to a disk together with a
//!   persistent overlay partition and a storage partition filling the rest
//! - `storage wipe` returns a disk to a blank state
//!
//! `install` and `network` are placeholders on the command surface.

mod commands;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;

use crucible::cancel::CancelToken;
use crucible::config::{Config, DEFAULT_CONFIG_FILE};
use crucible::{logging, units};

#[derive(Parser)]
#[command(name = "crucible", version)]
#[command(about = "Hyper-converged infrastructure management")]
#[command(
    after_help = "QUICK START:\n  crucible storage preflight                  Check host tools\n  crucible storage bootable DEVICE ISO        Show the layout\n  crucible storage bootable DEVICE ISO --yes  Write bootable media"
)]
struct Cli {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "CRUCIBLE_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Print verbose diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install a node from bootable media
    Install,

    /// Configure node networking
    Network,

    /// Storage operations
    Storage {
        #[command(subcommand)]
        what: StorageCommand,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum StorageCommand {
    /// Create bootable UEFI media with a persistent overlay.
    ///
    /// Writes a GPT partition table with the ISO in the first partition, a
    /// persistent overlayFS partition, and a larger storage partition. The
    /// storage partition is the remainder of the device after the overlay.
    Bootable {
        /// Target block device (or disk image file)
        device: PathBuf,

        /// Live ISO to write
        iso: PathBuf,

        /// Overlay partition size: MiB, or with a K/M/G/T suffix (default from config)
        #[arg(long, value_parser = units::parse_size)]
        overlay_size: Option<u64>,

        /// Confirm that everything on DEVICE will be destroyed
        #[arg(short, long)]
        yes: bool,

        /// Print the layout and exit without writing
        #[arg(long)]
        dry_run: bool,

        /// Print the dry-run layout as JSON
        #[arg(long, requires = "dry_run")]
        json: bool,

        /// Read the boot partition back and compare checksums
        #[arg(long)]
        verify: bool,
    },

    /// Wipe partition tables and filesystem signatures from a device
    Wipe {
        /// Target block device (or disk image file)
        device: PathBuf,

        /// Confirm that everything on DEVICE will be destroyed
        #[arg(short, long)]
        yes: bool,
    },

    /// Check that required host tools are installed
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (before parsing so CRUCIBLE_CONFIG applies)
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(cli.verbose);

    let config = Config::load(&cli.config)?;

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted: stopping after the current stage...");
            on_interrupt.cancel();
        }
    });

    tokio::task::spawn_blocking(move || dispatch(cli.command, &config, &cancel))
        .await
        .context("command task panicked")?
}

fn dispatch(command: Commands, config: &Config, cancel: &CancelToken) -> Result<()> {
    match command {
        Commands::Install => print_subcommand_help("install")?,
        Commands::Network => print_subcommand_help("network")?,
        Commands::Config => config.print(),

        Commands::Storage { what } => match what {
            StorageCommand::Bootable {
                device,
                iso,
                overlay_size,
                yes,
                dry_run,
                json,
                verify,
            } => {
                let args = commands::BootableArgs {
                    device,
                    iso,
                    overlay_size,
                    yes,
                    dry_run,
                    json,
                    verify,
                };
                commands::cmd_bootable(&args, config, cancel)?;
            }
            StorageCommand::Wipe { device, yes } => {
                commands::cmd_wipe(&device, yes, config)?;
            }
            StorageCommand::Preflight { strict } => {
                commands::cmd_preflight(config, strict)?;
            }
        },
    }

    Ok(())
}

fn print_subcommand_help(name: &str) -> Result<()> {
    let mut cli = Cli::command();
    let sub = cli
        .find_subcommand_mut(name)
        .with_context(|| format!("unknown command '{name}'"))?;
    sub.print_help()?;
    println!();
    Ok(())
}
