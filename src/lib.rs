//! crucible library exports.
//!
//! The binary is a thin clap front end over these modules; integration tests
//! under `tests/` use them directly.

pub mod cancel;
pub mod config;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod storage;
pub mod timing;
pub mod units;
