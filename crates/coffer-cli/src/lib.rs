#![warn(missing_docs)]

//! Coffer command-line front end: backup, scan, snapshots, ls

pub mod cli;
pub mod config;
pub mod logging;

pub use cli::{resolve_snapshot, Cli, Command};
pub use config::{CofferConfig, LogFormat};
