//! Compile-time configuration.

use log::LevelFilter;

/// Boot script read from the loader's volume when no load options are given.
pub const SCRIPT_PATH: &str = r"\EFI\Boot\linux.cfg";

#[cfg(feature = "verbose")]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(feature = "verbose"))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;
