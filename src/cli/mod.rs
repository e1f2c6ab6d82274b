//! CLI module for waypoint-fly - command-line interface and subcommands.
//!
//! Each subcommand exposes one library capability so it can be driven
//! outside a full planning session: commands, parsing, replay and the gate.

pub mod commands;

pub use commands::Cli;
