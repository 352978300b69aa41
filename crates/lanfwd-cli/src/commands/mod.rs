//! Subcommand implementations.

pub mod console;
pub mod serve;
