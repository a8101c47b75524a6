//! Connection records and the slab that owns them.
//!
//! Every live connection sits in one slot of a [`ConnectionTable`] and in
//! exactly one of two lists (server side, client side) linked through slot
//! indices, so unlinking is O(1) without back-pointers. Handles carry the
//! slot's generation; a handle to a closed connection never resolves, even
//! after the slot has been reused.

use crate::handshake::{Handshake, VerificationFlags};
use crate::registry::ProtocolKey;
use crate::security::{Converter, SecurityError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Generation-checked handle to a connection.
///
/// Only the connection manager creates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Which end opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionSide {
    /// Accepted by our listener.
    Server,
    /// Initiated by us.
    Client,
}

impl ConnectionSide {
    fn slot(self) -> usize {
        match self {
            ConnectionSide::Server => 0,
            ConnectionSide::Client => 1,
        }
    }
}

/// Socket tasks attached to a connection.
#[derive(Debug)]
pub(crate) struct ConnectionIo {
    /// Frames queued for the writer task. Dropping it ends the writer after
    /// the queue drains.
    pub outbound: mpsc::UnboundedSender<Bytes>,
    pub reader: AbortHandle,
}

impl Drop for ConnectionIo {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One connection.
pub(crate) struct Connection {
    pub side: ConnectionSide,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub protocol: Option<ProtocolKey>,
    pub protocol_name: String,
    pub raw_converter: Option<Converter>,
    pub protocol_converter: Option<Converter>,
    pub peer_module: Option<String>,
    pub info: Option<Box<dyn Any>>,
    pub handshake: Handshake,
    pub established: bool,
    pub connected_at: DateTime<Utc>,
    pub io: ConnectionIo,
}

impl Connection {
    /// Apply the protocol converter, then the raw one.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut out = payload.to_vec();
        if let Some(c) = self.protocol_converter.as_mut() {
            out = c.seal(&out)?;
        }
        if let Some(c) = self.raw_converter.as_mut() {
            out = c.seal(&out)?;
        }
        Ok(out)
    }

    /// Undo [`Connection::seal`]: raw converter first, then protocol.
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let mut out = frame.to_vec();
        if let Some(c) = self.raw_converter.as_mut() {
            out = c.open(&out)?;
        }
        if let Some(c) = self.protocol_converter.as_mut() {
            out = c.open(&out)?;
        }
        Ok(out)
    }

    /// Drop both converters; their key schedules are zeroized on drop.
    pub fn scrub(&mut self) {
        self.raw_converter = None;
        self.protocol_converter = None;
    }

    pub fn flags(&self) -> VerificationFlags {
        self.handshake.flags()
    }

    pub fn snapshot(&self, id: ConnectionId) -> ConnectionInfo {
        ConnectionInfo {
            id,
            side: self.side,
            peer_addr: self.peer_addr,
            local_addr: self.local_addr,
            protocol: self.protocol_name.clone(),
            peer_module: self.peer_module.clone(),
            flags: self.flags(),
            established: self.established,
            encrypted: self.raw_converter.is_some() || self.protocol_converter.is_some(),
            connected_at: self.connected_at,
        }
    }
}

/// Read-only view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub side: ConnectionSide,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Requested or assigned protocol; empty while an acceptor is unassigned.
    pub protocol: String,
    pub peer_module: Option<String>,
    pub flags: VerificationFlags,
    pub established: bool,
    pub encrypted: bool,
    pub connected_at: DateTime<Utc>,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
    prev: Option<u32>,
    next: Option<u32>,
    side: ConnectionSide,
}

#[derive(Default, Clone, Copy)]
struct ListEnds {
    head: Option<u32>,
    tail: Option<u32>,
}

/// Slab of connections with per-side index-linked lists.
pub(crate) struct ConnectionTable<T = Connection> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    lists: [ListEnds; 2],
    len: usize,
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lists: [ListEnds::default(); 2],
            len: 0,
        }
    }
}

impl<T> ConnectionTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The handle the next [`ConnectionTable::insert`] will return.
    pub fn next_id(&self) -> ConnectionId {
        match self.free.last() {
            Some(&index) => ConnectionId {
                index,
                generation: self.slots[index as usize].generation,
            },
            None => ConnectionId {
                index: self.slots.len() as u32,
                generation: 0,
            },
        }
    }

    /// Insert at the tail of `side`'s list.
    pub fn insert(&mut self, side: ConnectionSide, value: T) -> ConnectionId {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                    prev: None,
                    next: None,
                    side,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let ends = self.lists[side.slot()];
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        slot.side = side;
        slot.prev = ends.tail;
        slot.next = None;
        let generation = slot.generation;

        match ends.tail {
            Some(tail) => self.slots[tail as usize].next = Some(index),
            None => self.lists[side.slot()].head = Some(index),
        }
        self.lists[side.slot()].tail = Some(index);
        self.len += 1;
        ConnectionId { index, generation }
    }

    fn live(&self, id: ConnectionId) -> Option<&Slot<T>> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation && s.value.is_some())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.live(id).is_some()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&T> {
        self.live(id).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.value.as_mut())
    }

    /// Unlink and take the value; the slot's generation moves on.
    pub fn remove(&mut self, id: ConnectionId) -> Option<T> {
        self.live(id)?;
        let (prev, next, side) = {
            let slot = &self.slots[id.index as usize];
            (slot.prev, slot.next, slot.side)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.lists[side.slot()].head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.lists[side.slot()].tail = prev,
        }

        let slot = &mut self.slots[id.index as usize];
        slot.prev = None;
        slot.next = None;
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.free.push(id.index);
        self.len -= 1;
        value
    }

    /// Handles on one side, in insertion order.
    pub fn ids(&self, side: ConnectionSide) -> Vec<ConnectionId> {
        let mut out = Vec::new();
        let mut cursor = self.lists[side.slot()].head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            out.push(ConnectionId {
                index,
                generation: slot.generation,
            });
            cursor = slot.next;
        }
        out
    }

    /// Server-side handles followed by client-side ones.
    pub fn all_ids(&self) -> Vec<ConnectionId> {
        let mut out = self.ids(ConnectionSide::Server);
        out.extend(self.ids(ConnectionSide::Client));
        out
    }
}
