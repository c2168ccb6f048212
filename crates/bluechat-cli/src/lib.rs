//! BlueChat CLI library
//!
//! Argument parsing, configuration loading and the command handlers behind the
//! `bluechat` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::AppConfig;
pub use error::{CliError, Result};
