//! Errors from overlay lists and their network adapter.

use modnet_types::ModnetError;
use modnet_wire::WireError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum OverlayError {
    /// A `GrantToken` arrived with no request outstanding.
    #[error("token granted by {from} but no request was outstanding")]
    UnexpectedGrant { from: String },
    #[error("malformed instruction packet: {0}")]
    MalformedPacket(String),
    #[error("{instruction} is not valid for a {role} list")]
    WrongRole {
        instruction: &'static str,
        role: &'static str,
    },
}

pub type OverlayResult<T> = Result<T, OverlayError>;

impl From<OverlayError> for ModnetError {
    fn from(e: OverlayError) -> Self {
        ModnetError::Overlay(e.to_string())
    }
}

impl From<OverlayError> for WireError {
    fn from(e: OverlayError) -> Self {
        WireError::Handler(e.to_string())
    }
}
