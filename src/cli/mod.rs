//! CLI module
//!
//! Command-line arguments, runtime configuration and progress output.

pub mod args;
pub mod config;
pub mod progress;

pub use args::{CliArgs, Command};
pub use config::Config;
pub use progress::ProgressDisplay;
