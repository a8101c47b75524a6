//! modnet wire protocol: authenticated connections between modules.
//!
//! Every connection runs a fixed handshake before any application protocol
//! sees a byte: a magic/revision check, optional security negotiation for the
//! raw layer, protocol selection, optional per-protocol security, and a
//! module-name exchange.
//!
//! ## Architecture
//!
//! - **frame**: length-prefixed frames and fixed-field packet reading/writing
//! - **auth**: the per-user authorization file (security type per protocol)
//! - **security**: AES-256-GCM converters, challenges, sealed session keys
//! - **handshake**: sans-IO connection state machine
//! - **registry**: server/client protocol tables and the `ProtocolHandler` trait
//! - **connection**: connection slab with index-linked server/client lists
//! - **manager**: the single-threaded event loop tying it all together

pub mod auth;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod manager;
pub mod registry;
pub mod security;

pub use auth::{AuthPolicies, AuthPolicy, SecurityType, RAW_PROTOCOL};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionSide};
pub use error::{PacketError, WireError, WireResult};
pub use frame::{PacketReader, PacketWriter};
pub use manager::{ChildExit, ChildHandler, ConnectionManager, ConnectionMonitor, Context};
pub use registry::ProtocolHandler;
