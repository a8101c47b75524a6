//! Protocol registry: which protocols this process serves and dials.
//!
//! Registries hold a handful of entries, so both lists are plain vectors
//! searched by exact name. Entries are never removed.

use crate::connection::{ConnectionId, ConnectionSide};
use crate::error::WireError;
use crate::frame::PacketReader;
use crate::handshake::PROTOCOL_NAME_LEN;
use crate::manager::Context;
use std::net::SocketAddr;

/// Per-protocol callbacks, registered by value with the connection manager.
pub trait ProtocolHandler {
    /// Veto an outgoing attempt before any network I/O. Client entries only.
    fn validate(&mut self, _peer: SocketAddr) -> bool {
        true
    }

    /// The connection finished its handshake. An error closes it.
    fn on_open(&mut self, _cx: &mut Context<'_>, _conn: ConnectionId) -> Result<(), WireError> {
        Ok(())
    }

    /// One frame arrived. The handler must consume all of `packet`.
    fn on_read(
        &mut self,
        cx: &mut Context<'_>,
        conn: ConnectionId,
        packet: &mut PacketReader,
    ) -> Result<(), WireError>;

    /// The connection is closing. Its protocol count is already decremented.
    fn on_close(&mut self, _cx: &mut Context<'_>, _conn: ConnectionId) {}
}

/// Name, version and connection bound of one registered protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolEntry {
    pub name: String,
    pub version: u32,
    /// Live connections using this entry.
    pub current: u32,
    /// Upper bound on `current`; 0 means unlimited.
    pub max: u32,
}

impl ProtocolEntry {
    fn at_limit(&self) -> bool {
        self.max > 0 && self.current >= self.max
    }
}

/// Index of an entry within one side of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolKey {
    pub side: ConnectionSide,
    pub index: usize,
}

/// Server (accepted) and client (initiated) protocol lists.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    server: Vec<ProtocolEntry>,
    client: Vec<ProtocolEntry>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, side: ConnectionSide) -> &Vec<ProtocolEntry> {
        match side {
            ConnectionSide::Server => &self.server,
            ConnectionSide::Client => &self.client,
        }
    }

    fn list_mut(&mut self, side: ConnectionSide) -> &mut Vec<ProtocolEntry> {
        match side {
            ConnectionSide::Server => &mut self.server,
            ConnectionSide::Client => &mut self.client,
        }
    }

    /// Append an entry.
    ///
    /// # Panics
    /// On a duplicate name within the same side, or a name that does not fit
    /// the protocol request field.
    pub fn register(&mut self, side: ConnectionSide, name: &str, version: u32, max: u32) -> ProtocolKey {
        assert!(
            name.len() <= PROTOCOL_NAME_LEN,
            "protocol name \"{name}\" exceeds {PROTOCOL_NAME_LEN} bytes"
        );
        assert!(
            self.find(side, name).is_none(),
            "{side:?} protocol \"{name}\" registered twice"
        );
        let list = self.list_mut(side);
        list.push(ProtocolEntry {
            name: name.to_string(),
            version,
            current: 0,
            max,
        });
        ProtocolKey {
            side,
            index: list.len() - 1,
        }
    }

    pub fn find(&self, side: ConnectionSide, name: &str) -> Option<ProtocolKey> {
        self.list(side)
            .iter()
            .position(|e| e.name == name)
            .map(|index| ProtocolKey { side, index })
    }

    pub fn entry(&self, key: ProtocolKey) -> &ProtocolEntry {
        &self.list(key.side)[key.index]
    }

    pub fn server_entries(&self) -> &[ProtocolEntry] {
        &self.server
    }

    pub fn client_entries(&self) -> &[ProtocolEntry] {
        &self.client
    }

    /// Resolve an incoming protocol request and reserve one slot.
    ///
    /// The error is the rejection text sent to the peer; nothing is changed.
    pub fn accept(&mut self, name: &str, version: u32) -> Result<ProtocolKey, String> {
        let key = self
            .find(ConnectionSide::Server, name)
            .ok_or_else(|| format!("Protocol \"{name}\" not supported"))?;
        let entry = &mut self.server[key.index];
        if entry.version != version {
            return Err(format!("Protocol \"{name}\" version mismatch"));
        }
        if entry.at_limit() {
            return Err(format!("Connection limit reached for protocol \"{name}\""));
        }
        entry.current += 1;
        Ok(key)
    }

    /// Reserve a slot for an outgoing connection.
    pub fn reserve(&mut self, key: ProtocolKey) -> Result<(), WireError> {
        let entry = &mut self.list_mut(key.side)[key.index];
        if entry.at_limit() {
            return Err(WireError::LimitReached(entry.name.clone()));
        }
        entry.current += 1;
        Ok(())
    }

    pub fn release(&mut self, key: ProtocolKey) {
        let entry = &mut self.list_mut(key.side)[key.index];
        debug_assert!(entry.current > 0, "release without reserve on \"{}\"", entry.name);
        entry.current = entry.current.saturating_sub(1);
    }

    /// Live connections of a protocol across both sides.
    pub fn connection_count(&self, name: &str) -> u32 {
        self.server
            .iter()
            .chain(self.client.iter())
            .filter(|e| e.name == name)
            .map(|e| e.current)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_resolves_and_counts() {
        let mut registry = ProtocolRegistry::new();
        let key = registry.register(ConnectionSide::Server, "overlay", 1, 2);

        assert_eq!(registry.accept("overlay", 1), Ok(key));
        assert_eq!(registry.entry(key).current, 1);
        assert_eq!(
            registry.accept("missing", 1),
            Err("Protocol \"missing\" not supported".to_string())
        );
        assert_eq!(
            registry.accept("overlay", 2),
            Err("Protocol \"overlay\" version mismatch".to_string())
        );
        assert_eq!(registry.entry(key).current, 1);
    }

    #[test]
    fn test_limit_rejects_without_increment() {
        let mut registry = ProtocolRegistry::new();
        let key = registry.register(ConnectionSide::Server, "overlay", 1, 1);
        registry.accept("overlay", 1).unwrap();
        let err = registry.accept("overlay", 1).unwrap_err();
        assert!(err.contains("limit reached"));
        assert_eq!(registry.entry(key).current, 1);

        registry.release(key);
        assert!(registry.accept("overlay", 1).is_ok());
    }

    #[test]
    fn test_zero_max_is_unlimited() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ConnectionSide::Server, "stdio", 1, 0);
        for _ in 0..100 {
            registry.accept("stdio", 1).unwrap();
        }
        assert_eq!(registry.connection_count("stdio"), 100);
    }

    #[test]
    fn test_count_spans_both_sides() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ConnectionSide::Server, "overlay", 1, 0);
        let client = registry.register(ConnectionSide::Client, "overlay", 1, 1);
        registry.accept("overlay", 1).unwrap();
        registry.reserve(client).unwrap();
        assert_eq!(registry.connection_count("overlay"), 2);
        assert!(matches!(
            registry.reserve(client),
            Err(WireError::LimitReached(name)) if name == "overlay"
        ));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ConnectionSide::Client, "overlay", 1, 0);
        registry.register(ConnectionSide::Client, "overlay", 2, 0);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn test_long_name_panics() {
        let mut registry = ProtocolRegistry::new();
        registry.register(ConnectionSide::Server, &"p".repeat(81), 1, 0);
    }
}
