//! Subcommand implementations

pub mod endpoints;
pub mod setup;
pub mod verify;
