//! Errors from the wire protocol layer.

use crate::auth::AuthError;
use crate::handshake::HandshakeError;
use crate::security::SecurityError;
use modnet_types::ModnetError;
use thiserror::Error;

/// Errors from the wire protocol layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed packet: {0}")]
    Packet(#[from] PacketError),
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Security failure: {0}")]
    Security(#[from] SecurityError),
    #[error("Authorization: {0}")]
    Auth(#[from] AuthError),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },
    #[error("No client protocol registered as \"{0}\"")]
    UnknownProtocol(String),
    #[error("Connection to {addr} vetoed by protocol \"{protocol}\"")]
    Vetoed { protocol: String, addr: String },
    #[error("Connection limit reached for protocol \"{0}\"")]
    LimitReached(String),
    #[error("Connection handle is stale")]
    StaleConnection,
    #[error("Protocol handler failed: {0}")]
    Handler(String),
    #[error("Lost the link to the supervising orchestrator: {0}")]
    SupervisorLost(String),
}

/// Errors decoding fixed fields out of a packet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("field of {len} bytes exceeds width {max}")]
    FieldTooLong { len: usize, max: usize },
}

/// Alias for wire results.
pub type WireResult<T> = Result<T, WireError>;

impl From<WireError> for ModnetError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => ModnetError::Io(io),
            WireError::Auth(auth) => ModnetError::Auth(auth.to_string()),
            other => ModnetError::Network(other.to_string()),
        }
    }
}
