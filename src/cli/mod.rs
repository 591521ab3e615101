//! Command-line handlers

pub mod commands;

pub use commands::{cmd_address, cmd_header, cmd_start, CliResult};
