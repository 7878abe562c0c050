//! CLI module for crmq.

mod commands;

pub use commands::{Cli, Commands, ConfigCommands};
