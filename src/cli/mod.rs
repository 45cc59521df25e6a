//! CLI module for toolmux - command-line interface and subcommands.

pub mod commands;

pub use commands::Cli;
