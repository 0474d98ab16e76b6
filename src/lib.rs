// src/lib.rs
//
// Serial terminal engine: byte codec, frame assembly, port registry and the
// session controller that owns the active connection.

#[macro_use]
mod logging;

pub mod io;
pub mod message_log;
pub mod settings;

#[cfg(feature = "cli")]
mod cli;

pub use logging::{init_file_logging, stop_file_logging};

/// Entry point for the `serialdeck` binary
#[cfg(feature = "cli")]
pub fn run_cli() -> Result<(), String> {
    cli::run()
}
