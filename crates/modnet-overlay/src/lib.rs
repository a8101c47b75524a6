//! Replicated overlay object lists.
//!
//! A master list and its slaves hold identical, identically ordered lists of
//! annotation objects. Only the holder of the single token may originate a
//! mutation; everyone else queues locally and asks for the token.
//!
//! - **object**: shapes, object keys, specs and instructions
//! - **list**: the sans-IO token-passing state machine
//! - **packet**: the JSON wire record
//! - **render**: `Renderer` targets matched by spec
//! - **protocol**: the `overlay` protocol handler for the connection manager

pub mod error;
pub mod list;
pub mod object;
pub mod packet;
pub mod protocol;
pub mod render;

pub use error::{OverlayError, OverlayResult};
pub use list::{Outbound, OverlayList, RenderEvent, Role, TokenState};
pub use object::{Coord, CoordSystem, Instruction, Mutation, ObjectKey, OverlayObject, OverlaySpec, Shape};
pub use packet::InstructionPacket;
pub use protocol::{Overlay, OverlayProtocol, OVERLAY_PROTOCOL, OVERLAY_VERSION};
pub use render::{RenderTargets, Renderer};
