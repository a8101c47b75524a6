//! Shared types for the modnet workspace.
//!
//! Holds the configuration structures and the top-level error type used by the
//! wire, overlay and fleet crates. It contains no networking or process logic.

pub mod config;
pub mod error;

pub use config::{FleetConfig, ModnetConfig, SameHostPolicy, WireConfig};
pub use error::{ModnetError, ModnetResult};
