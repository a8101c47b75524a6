//! Subcommand implementations. Each returns the process exit code.

pub mod overlay;
pub mod run;
pub mod slave;
