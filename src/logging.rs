//! Diagnostic logging setup.
//!
//! Progress meant for the operator is printed to stdout. `tracing` output goes
//! to stderr and is quiet unless `RUST_LOG` or `--verbose` asks for more.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "crucible=debug,info"
    } else {
        "warn"
    }
}

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
