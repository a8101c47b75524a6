//! Shared error types for modnet.

use thiserror::Error;

/// Top-level error type for the modnet system.
#[derive(Error, Debug)]
pub enum ModnetError {
    /// A configuration value is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A transport or handshake error on some connection.
    #[error("Network error: {0}")]
    Network(String),

    /// The authorization file could not be used.
    #[error("Authorization error: {0}")]
    Auth(String),

    /// The replicated overlay protocol failed.
    #[error("Overlay error: {0}")]
    Overlay(String),

    /// The orchestration run failed.
    #[error("Orchestration failed: {0}")]
    Orchestration(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for Result with ModnetError.
pub type ModnetResult<T> = Result<T, ModnetError>;
