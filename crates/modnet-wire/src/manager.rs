//! The connection manager: one event loop for every connection and child.
//!
//! Socket tasks only move frames. Each reader forwards complete frames to a
//! single event channel; each writer drains a per-connection queue. All
//! protocol work (handshakes, handler callbacks, bookkeeping, child exits)
//! happens serially inside [`ConnectionManager::poll`], so per-connection
//! frame order is preserved end to end and no state needs locking.

use crate::auth::AuthPolicies;
use crate::connection::{
    Connection, ConnectionId, ConnectionInfo, ConnectionIo, ConnectionSide, ConnectionTable,
};
use crate::error::{WireError, WireResult};
use crate::frame::{json_payload, read_frame, write_frame, PacketReader};
use crate::handshake::{Action, Handshake, HandshakeEnv, ProtocolResolver, Stage};
use crate::registry::{ProtocolHandler, ProtocolKey, ProtocolRegistry};
use crate::security::same_host;
use bytes::Bytes;
use chrono::Utc;
use modnet_types::{ModnetConfig, SameHostPolicy};
use serde::Serialize;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    /// Exited with status 0.
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ChildExit::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ChildExit::Signaled(signal);
            }
        }
        ChildExit::Exited(-1)
    }
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exited with status {code}"),
            ChildExit::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Receives child-exit notifications from the event loop.
pub trait ChildHandler {
    fn child_exited(&mut self, cx: &mut Context<'_>, pid: u32, exit: ChildExit);
}

/// External observer of connection lifecycle events.
pub trait ConnectionMonitor {
    /// The listener is bound.
    fn listening(&mut self, _cx: &mut Context<'_>, _port: u16) {}

    /// A connection finished its handshake and its `on_open` succeeded.
    fn connection_opened(&mut self, _cx: &mut Context<'_>, _info: &ConnectionInfo) {}

    /// A connection was unlinked. Called for failed handshakes too.
    fn connection_closed(&mut self, _cx: &mut Context<'_>, _info: &ConnectionInfo) {}

    /// A deferred connect could not be started.
    fn connect_failed(
        &mut self,
        _cx: &mut Context<'_>,
        _addr: SocketAddr,
        _protocol: &str,
        _error: &WireError,
    ) {
    }
}

/// Inputs to the event loop.
pub(crate) enum Event {
    Accepted { stream: TcpStream, peer: SocketAddr },
    Frame { conn: ConnectionId, data: Bytes },
    Closed { conn: ConnectionId, error: Option<WireError> },
    ChildExited { pid: u32, exit: ChildExit },
}

/// Work requested from inside a callback, run after the callback returns.
enum Deferred {
    Close(ConnectionId),
    Connect { addr: SocketAddr, protocol: String },
}

/// State shared by the manager and every callback.
pub(crate) struct Core {
    module_name: String,
    policies: AuthPolicies,
    same_host: SameHostPolicy,
    registry: ProtocolRegistry,
    table: ConnectionTable,
    events: mpsc::UnboundedSender<Event>,
    deferred: VecDeque<Deferred>,
    listen_addr: Option<SocketAddr>,
    children: HashSet<u32>,
    supervisor: Option<ConnectionId>,
    shutdown: bool,
    fatal: Option<WireError>,
}

impl Core {
    fn spawn_child(&mut self, command: &mut Command) -> WireResult<u32> {
        let mut child = command.spawn()?;
        let Some(pid) = child.id() else {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "child exited before its pid was read",
            )));
        };
        self.children.insert(pid);
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => ChildExit::from(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for child");
                    ChildExit::Exited(-1)
                }
            };
            let _ = events.send(Event::ChildExited { pid, exit });
        });
        debug!(pid, "Spawned child");
        Ok(pid)
    }
}

/// What a callback may do while the event loop is inside it.
///
/// Sends go straight to the connection's write queue. Closes and connects
/// are deferred until the current callback returns.
pub struct Context<'a> {
    core: &'a mut Core,
}

impl<'a> Context<'a> {
    pub fn module_name(&self) -> &str {
        &self.core.module_name
    }

    /// Send one frame on an established connection.
    pub fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> WireResult<()> {
        let c = self
            .core
            .table
            .get_mut(conn)
            .ok_or(WireError::StaleConnection)?;
        if !c.established {
            return Err(WireError::Handler(format!(
                "connection {conn} has not finished its handshake"
            )));
        }
        let frame = c.seal(payload)?;
        c.io
            .outbound
            .send(Bytes::from(frame))
            .map_err(|_| WireError::ConnectionClosed)
    }

    pub fn send_json<T: Serialize>(&mut self, conn: ConnectionId, value: &T) -> WireResult<()> {
        let payload = json_payload(value)?;
        self.send(conn, &payload)
    }

    /// Close a connection once the current callback returns.
    pub fn close(&mut self, conn: ConnectionId) {
        self.core.deferred.push_back(Deferred::Close(conn));
    }

    /// Open a client connection once the current callback returns. Failures
    /// reach [`ConnectionMonitor::connect_failed`].
    pub fn connect(&mut self, addr: SocketAddr, protocol: impl Into<String>) {
        self.core.deferred.push_back(Deferred::Connect {
            addr,
            protocol: protocol.into(),
        });
    }

    pub fn connection_info(&self, conn: ConnectionId) -> Option<ConnectionInfo> {
        self.core.table.get(conn).map(|c| c.snapshot(conn))
    }

    /// Established connections using `protocol`, server side first.
    pub fn connections_for(&self, protocol: &str) -> Vec<ConnectionId> {
        connections_for(&self.core.table, protocol)
    }

    pub fn connection_count(&self, protocol: &str) -> u32 {
        self.core.registry.connection_count(protocol)
    }

    /// Attach per-protocol data to a connection, replacing any previous value.
    pub fn set_info<T: Any>(&mut self, conn: ConnectionId, value: T) -> WireResult<()> {
        let c = self
            .core
            .table
            .get_mut(conn)
            .ok_or(WireError::StaleConnection)?;
        c.info = Some(Box::new(value));
        Ok(())
    }

    pub fn info_mut<T: Any>(&mut self, conn: ConnectionId) -> Option<&mut T> {
        self.core
            .table
            .get_mut(conn)?
            .info
            .as_mut()?
            .downcast_mut::<T>()
    }

    /// Spawn a supervised child; its exit arrives as a [`ChildHandler`] event.
    pub fn spawn_child(&mut self, command: &mut Command) -> WireResult<u32> {
        self.core.spawn_child(command)
    }

    pub fn child_count(&self) -> usize {
        self.core.children.len()
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.core.listen_addr.map(|a| a.port())
    }

    /// Make losing `conn` fatal to the event loop.
    pub fn set_supervisor_link(&mut self, conn: ConnectionId) {
        self.core.supervisor = Some(conn);
    }

    /// Ask [`ConnectionManager::run`] to return.
    pub fn request_shutdown(&mut self) {
        self.core.shutdown = true;
    }
}

fn connections_for(table: &ConnectionTable, protocol: &str) -> Vec<ConnectionId> {
    table
        .all_ids()
        .into_iter()
        .filter(|id| {
            table
                .get(*id)
                .is_some_and(|c| c.established && c.protocol_name == protocol)
        })
        .collect()
}

impl ProtocolResolver for ProtocolRegistry {
    fn resolve(&mut self, name: &str, version: u32) -> Result<(), String> {
        self.accept(name, version).map(|_| ())
    }
}

#[derive(Default)]
struct Handlers {
    server: Vec<Box<dyn ProtocolHandler>>,
    client: Vec<Box<dyn ProtocolHandler>>,
}

impl Handlers {
    fn get(&mut self, key: ProtocolKey) -> &mut dyn ProtocolHandler {
        match key.side {
            ConnectionSide::Server => self.server[key.index].as_mut(),
            ConnectionSide::Client => self.client[key.index].as_mut(),
        }
    }
}

/// Owns every connection, the protocol registry and the event loop.
pub struct ConnectionManager {
    core: Core,
    handlers: Handlers,
    monitor: Option<Box<dyn ConnectionMonitor>>,
    child_handler: Option<Box<dyn ChildHandler>>,
    events: mpsc::UnboundedReceiver<Event>,
    listener: Option<AbortHandle>,
}

impl ConnectionManager {
    pub fn new(module_name: impl Into<String>, policies: AuthPolicies, same_host: SameHostPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core: Core {
                module_name: module_name.into(),
                policies,
                same_host,
                registry: ProtocolRegistry::new(),
                table: ConnectionTable::new(),
                events: tx,
                deferred: VecDeque::new(),
                listen_addr: None,
                children: HashSet::new(),
                supervisor: None,
                shutdown: false,
                fatal: None,
            },
            handlers: Handlers::default(),
            monitor: None,
            child_handler: None,
            events: rx,
            listener: None,
        }
    }

    /// Build from configuration, loading the authorization file.
    pub fn from_config(config: &ModnetConfig) -> WireResult<Self> {
        let policies = AuthPolicies::load(&config.wire.auth_file_path())?;
        Ok(Self::new(
            config.module_name.clone(),
            policies,
            config.wire.same_host,
        ))
    }

    pub fn module_name(&self) -> &str {
        &self.core.module_name
    }

    /// Accept `name`/`version` from peers, at most `max` at once (0 = no limit).
    ///
    /// # Panics
    /// If `name` is already registered as a server protocol.
    pub fn register_server_protocol(
        &mut self,
        name: &str,
        version: u32,
        max: u32,
        handler: impl ProtocolHandler + 'static,
    ) {
        self.core
            .registry
            .register(ConnectionSide::Server, name, version, max);
        self.handlers.server.push(Box::new(handler));
    }

    /// Allow outgoing connections for `name`/`version`.
    ///
    /// # Panics
    /// If `name` is already registered as a client protocol.
    pub fn register_client_protocol(
        &mut self,
        name: &str,
        version: u32,
        max: u32,
        handler: impl ProtocolHandler + 'static,
    ) {
        self.core
            .registry
            .register(ConnectionSide::Client, name, version, max);
        self.handlers.client.push(Box::new(handler));
    }

    pub fn set_monitor(&mut self, monitor: impl ConnectionMonitor + 'static) {
        self.monitor = Some(Box::new(monitor));
    }

    pub fn set_child_handler(&mut self, handler: impl ChildHandler + 'static) {
        self.child_handler = Some(Box::new(handler));
    }

    /// Context for application code running outside a callback.
    pub fn context(&mut self) -> Context<'_> {
        Context {
            core: &mut self.core,
        }
    }

    /// Bind the listener and start accepting.
    pub async fn serve(&mut self, addr: SocketAddr) -> WireResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let events = self.core.events.clone();
        self.listener = Some(tokio::spawn(accept_loop(listener, events)).abort_handle());
        self.core.listen_addr = Some(local);
        info!(module = %self.core.module_name, addr = %local, "Listening");
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.listening(
                &mut Context {
                    core: &mut self.core,
                },
                local.port(),
            );
        }
        Ok(local)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.core.listen_addr
    }

    /// Open a client connection and start its handshake.
    ///
    /// The protocol's `validate` runs before any network I/O, and the
    /// connection bound is checked before connecting. The returned handle
    /// becomes usable once the handshake establishes.
    pub async fn connect(&mut self, addr: SocketAddr, protocol: &str) -> WireResult<ConnectionId> {
        let key = self
            .core
            .registry
            .find(ConnectionSide::Client, protocol)
            .ok_or_else(|| WireError::UnknownProtocol(protocol.to_string()))?;
        if !self.handlers.get(key).validate(addr) {
            debug!(%addr, protocol, "Outgoing connection vetoed");
            return Err(WireError::Vetoed {
                protocol: protocol.to_string(),
                addr: addr.to_string(),
            });
        }
        self.core.registry.reserve(key)?;

        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.core.registry.release(key);
                return Err(e.into());
            }
        };
        let version = self.core.registry.entry(key).version;
        let handshake = Handshake::initiator(protocol, version);
        match self.adopt(stream, ConnectionSide::Client, handshake, Some(key), protocol) {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.core.registry.release(key);
                Err(e)
            }
        }
    }

    /// Wait up to `timeout` for the first event, then handle everything
    /// already queued. Returns the number of events handled.
    pub async fn poll(&mut self, timeout: Duration) -> WireResult<usize> {
        self.run_deferred().await;
        self.check_fatal()?;

        let first = match tokio::time::timeout(timeout, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) | Err(_) => return Ok(0),
        };
        self.dispatch(first).await;
        let mut handled = 1;
        while let Ok(event) = self.events.try_recv() {
            self.check_fatal()?;
            self.dispatch(event).await;
            handled += 1;
        }
        self.check_fatal()?;
        Ok(handled)
    }

    /// Keep handling events until `done` holds or `attempts` intervals of
    /// `interval` have elapsed. Returns whether `done` held.
    pub async fn wait_until<F>(&mut self, attempts: u32, interval: Duration, mut done: F) -> WireResult<bool>
    where
        F: FnMut() -> bool,
    {
        for _ in 0..attempts {
            if done() {
                return Ok(true);
            }
            let deadline = Instant::now() + interval;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                self.poll(deadline - now).await?;
                if done() {
                    return Ok(true);
                }
            }
        }
        Ok(done())
    }

    /// Handle events for `duration`.
    pub async fn poll_for(&mut self, duration: Duration) -> WireResult<()> {
        self.wait_until(1, duration, || false).await.map(|_| ())
    }

    /// Handle events until a callback requests shutdown.
    pub async fn run(&mut self) -> WireResult<()> {
        while !self.core.shutdown {
            self.poll(Duration::from_millis(250)).await?;
        }
        info!(module = %self.core.module_name, "Event loop stopped");
        Ok(())
    }

    pub fn shutdown_requested(&self) -> bool {
        self.core.shutdown
    }

    pub fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> WireResult<()> {
        self.context().send(conn, payload)
    }

    pub fn send_json<T: Serialize>(&mut self, conn: ConnectionId, value: &T) -> WireResult<()> {
        self.context().send_json(conn, value)
    }

    /// Close a connection now.
    pub fn close(&mut self, conn: ConnectionId) {
        self.close_now(conn, None);
    }

    pub fn connection_info(&self, conn: ConnectionId) -> Option<ConnectionInfo> {
        self.core.table.get(conn).map(|c| c.snapshot(conn))
    }

    /// Live connections of `protocol` on both sides, established or not.
    pub fn connection_count(&self, protocol: &str) -> u32 {
        self.core.registry.connection_count(protocol)
    }

    /// The `n`th established connection using `protocol`.
    pub fn nth_connection(&self, protocol: &str, n: usize) -> Option<ConnectionId> {
        connections_for(&self.core.table, protocol).into_iter().nth(n)
    }

    pub fn connections_for(&self, protocol: &str) -> Vec<ConnectionId> {
        connections_for(&self.core.table, protocol)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core
            .table
            .all_ids()
            .into_iter()
            .filter_map(|id| self.connection_info(id))
            .collect()
    }

    pub fn spawn_child(&mut self, command: &mut Command) -> WireResult<u32> {
        self.core.spawn_child(command)
    }

    pub fn child_count(&self) -> usize {
        self.core.children.len()
    }

    pub fn set_supervisor_link(&mut self, conn: ConnectionId) {
        self.core.supervisor = Some(conn);
    }

    fn check_fatal(&mut self) -> WireResult<()> {
        match self.core.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Register a socket as a connection and spawn its I/O tasks.
    fn adopt(
        &mut self,
        stream: TcpStream,
        side: ConnectionSide,
        mut handshake: Handshake,
        protocol: Option<ProtocolKey>,
        protocol_name: &str,
    ) -> WireResult<ConnectionId> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let id = self.core.table.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(id, write_half, rx, self.core.events.clone()));
        let reader = tokio::spawn(read_loop(id, read_half, self.core.events.clone())).abort_handle();

        let start = handshake.start();
        let inserted = self.core.table.insert(
            side,
            Connection {
                side,
                peer_addr,
                local_addr,
                protocol,
                protocol_name: protocol_name.to_string(),
                raw_converter: None,
                protocol_converter: None,
                peer_module: None,
                info: None,
                handshake,
                established: false,
                connected_at: Utc::now(),
                io: ConnectionIo {
                    outbound: tx,
                    reader,
                },
            },
        );
        debug_assert_eq!(inserted, id);
        debug!(conn = %id, ?side, peer = %peer_addr, "Connection opened");
        self.apply_actions(id, start);
        Ok(id)
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Accepted { stream, peer } => {
                if let Err(e) = self.adopt(
                    stream,
                    ConnectionSide::Server,
                    Handshake::acceptor(),
                    None,
                    "",
                ) {
                    warn!(%peer, error = %e, "Failed to adopt accepted connection");
                }
            }
            Event::Frame { conn, data } => self.on_frame(conn, data),
            Event::Closed { conn, error } => {
                if self.core.table.contains(conn) {
                    match &error {
                        Some(e) => debug!(%conn, error = %e, "Transport error"),
                        None => debug!(%conn, "Peer closed connection"),
                    }
                    self.close_now(conn, error);
                }
            }
            Event::ChildExited { pid, exit } => {
                self.core.children.remove(&pid);
                info!(pid, %exit, "Child exited");
                if let Some(handler) = self.child_handler.as_mut() {
                    handler.child_exited(
                        &mut Context {
                            core: &mut self.core,
                        },
                        pid,
                        exit,
                    );
                }
            }
        }
        self.run_deferred().await;
    }

    async fn run_deferred(&mut self) {
        while let Some(work) = self.core.deferred.pop_front() {
            match work {
                Deferred::Close(conn) => self.close_now(conn, None),
                Deferred::Connect { addr, protocol } => {
                    if let Err(e) = self.connect(addr, &protocol).await {
                        warn!(%addr, protocol = %protocol, error = %e, "Connect failed");
                        if let Some(monitor) = self.monitor.as_mut() {
                            monitor.connect_failed(
                                &mut Context {
                                    core: &mut self.core,
                                },
                                addr,
                                &protocol,
                                &e,
                            );
                        }
                    }
                }
            }
        }
    }

    fn on_frame(&mut self, conn: ConnectionId, data: Bytes) {
        let Some(c) = self.core.table.get_mut(conn) else {
            return;
        };
        let plain = match c.open(&data) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(%conn, error = %e, "Dropping connection");
                self.close_now(conn, Some(e.into()));
                return;
            }
        };

        if !c.established {
            let core = &mut self.core;
            let Some(c) = core.table.get_mut(conn) else {
                return;
            };
            let mut env = HandshakeEnv {
                policies: &core.policies,
                same_host: same_host(c.local_addr, c.peer_addr, core.same_host),
                module_name: &core.module_name,
                resolver: &mut core.registry,
            };
            let actions = c.handshake.on_frame(Bytes::from(plain), &mut env);
            self.apply_actions(conn, actions);
            return;
        }

        let Some(key) = c.protocol else {
            panic!("established connection {conn} has no protocol");
        };
        let mut packet = PacketReader::new(plain);
        let result = self.handlers.get(key).on_read(
            &mut Context {
                core: &mut self.core,
            },
            conn,
            &mut packet,
        );
        match result {
            Ok(()) => assert!(
                packet.is_drained(),
                "read handler for connection {conn} left {} of {} bytes unread",
                packet.remaining(),
                packet.remaining() + packet.consumed()
            ),
            Err(e) => {
                warn!(%conn, error = %e, "Protocol handler failed, closing connection");
                self.close_now(conn, Some(e));
            }
        }
    }

    fn apply_actions(&mut self, conn: ConnectionId, actions: Vec<Action>) {
        for action in actions {
            let Some(c) = self.core.table.get_mut(conn) else {
                return;
            };
            match action {
                Action::Send(payload) => {
                    let sent = c
                        .seal(&payload)
                        .map_err(WireError::from)
                        .and_then(|frame| {
                            c.io
                                .outbound
                                .send(Bytes::from(frame))
                                .map_err(|_| WireError::ConnectionClosed)
                        });
                    if let Err(e) = sent {
                        self.close_now(conn, Some(e));
                        return;
                    }
                }
                Action::Install(Stage::Raw, converter) => c.raw_converter = Some(converter),
                Action::Install(Stage::Protocol, converter) => {
                    c.protocol_converter = Some(converter)
                }
                Action::Drop(Stage::Raw) => c.raw_converter = None,
                Action::Drop(Stage::Protocol) => c.protocol_converter = None,
                Action::ProtocolAssigned { name, version } => {
                    c.protocol = self.core.registry.find(ConnectionSide::Server, &name);
                    debug!(%conn, protocol = %name, version, "Protocol assigned");
                    c.protocol_name = name;
                }
                Action::Established { peer_module } => {
                    c.established = true;
                    c.peer_module = Some(peer_module);
                    let info = c.snapshot(conn);
                    info!(
                        conn = %conn,
                        protocol = %info.protocol,
                        peer = %info.peer_addr,
                        peer_module = info.peer_module.as_deref().unwrap_or(""),
                        encrypted = info.encrypted,
                        "Connection established"
                    );
                    self.open_established(conn, info);
                }
                Action::Fail(e) => {
                    if e.is_security_failure() {
                        warn!(%conn, peer = %c.peer_addr, error = %e, "Security negotiation failed");
                    } else {
                        info!(%conn, peer = %c.peer_addr, error = %e, "Handshake failed");
                    }
                    self.close_now(conn, Some(e.into()));
                    return;
                }
            }
        }
    }

    fn open_established(&mut self, conn: ConnectionId, info: ConnectionInfo) {
        let Some(key) = self.core.table.get(conn).and_then(|c| c.protocol) else {
            panic!("established connection {conn} has no protocol");
        };
        let opened = self.handlers.get(key).on_open(
            &mut Context {
                core: &mut self.core,
            },
            conn,
        );
        if let Err(e) = opened {
            warn!(%conn, error = %e, "Open handler failed, closing connection");
            self.close_now(conn, Some(e));
            return;
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.connection_opened(
                &mut Context {
                    core: &mut self.core,
                },
                &info,
            );
        }
    }

    /// Tear down one connection in a fixed order: release its protocol slot,
    /// run `on_close`, unlink, notify the monitor, scrub keys, stop I/O.
    fn close_now(&mut self, conn: ConnectionId, error: Option<WireError>) {
        let Some(c) = self.core.table.get(conn) else {
            return;
        };
        let (key, established) = (c.protocol, c.established);

        if let Some(key) = key {
            self.core.registry.release(key);
            if established {
                self.handlers.get(key).on_close(
                    &mut Context {
                        core: &mut self.core,
                    },
                    conn,
                );
            }
        }

        let Some(mut c) = self.core.table.remove(conn) else {
            return;
        };
        let info = c.snapshot(conn);
        debug!(%conn, protocol = %info.protocol, "Connection closed");
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.connection_closed(
                &mut Context {
                    core: &mut self.core,
                },
                &info,
            );
        }
        c.scrub();
        drop(c);

        if self.core.supervisor == Some(conn) {
            let reason = error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "connection closed".to_string());
            error!(%conn, reason = %reason, "Lost the supervising link");
            self.core.supervisor = None;
            self.core.fatal = Some(WireError::SupervisorLost(reason));
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted connection");
                if events.send(Event::Accepted { stream, peer }).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn read_loop(conn: ConnectionId, mut reader: OwnedReadHalf, events: mpsc::UnboundedSender<Event>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(data) => {
                if events.send(Event::Frame { conn, data }).is_err() {
                    return;
                }
            }
            Err(WireError::ConnectionClosed) => {
                let _ = events.send(Event::Closed { conn, error: None });
                return;
            }
            Err(e) => {
                let _ = events.send(Event::Closed {
                    conn,
                    error: Some(e),
                });
                return;
            }
        }
    }
}

async fn write_loop(
    conn: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            let _ = events.send(Event::Closed {
                conn,
                error: Some(e),
            });
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthPolicy, SecurityType, RAW_PROTOCOL};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        opened: Vec<ConnectionId>,
        read: Vec<String>,
        closed: Vec<(ConnectionId, u32)>,
        monitor_closed: Vec<ConnectionId>,
        validated: u32,
    }

    type Shared = Rc<RefCell<Log>>;

    /// Records callbacks; echoes "ping" as "pong".
    struct Recorder {
        log: Shared,
        protocol: &'static str,
        veto: bool,
    }

    impl Recorder {
        fn new(log: &Shared, protocol: &'static str) -> Self {
            Self {
                log: log.clone(),
                protocol,
                veto: false,
            }
        }
    }

    impl ProtocolHandler for Recorder {
        fn validate(&mut self, _peer: SocketAddr) -> bool {
            self.log.borrow_mut().validated += 1;
            !self.veto
        }

        fn on_open(&mut self, _cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
            self.log.borrow_mut().opened.push(conn);
            Ok(())
        }

        fn on_read(
            &mut self,
            cx: &mut Context<'_>,
            conn: ConnectionId,
            packet: &mut PacketReader,
        ) -> WireResult<()> {
            let text = packet.get_string()?;
            if text == "ping" {
                cx.send(conn, &crate::frame::PacketWriter::new().put_string("pong").finish())?;
            }
            self.log.borrow_mut().read.push(text);
            Ok(())
        }

        fn on_close(&mut self, cx: &mut Context<'_>, conn: ConnectionId) {
            let count = cx.connection_count(self.protocol);
            self.log.borrow_mut().closed.push((conn, count));
        }
    }

    struct MonitorLog(Shared);

    impl ConnectionMonitor for MonitorLog {
        fn connection_closed(&mut self, _cx: &mut Context<'_>, info: &ConnectionInfo) {
            self.0.borrow_mut().monitor_closed.push(info.id);
        }
    }

    fn manager(name: &str, policies: AuthPolicies) -> ConnectionManager {
        ConnectionManager::new(name, policies, SameHostPolicy::Never)
    }

    async fn pump<F: FnMut(&ConnectionManager, &ConnectionManager) -> bool>(
        a: &mut ConnectionManager,
        b: &mut ConnectionManager,
        mut done: F,
    ) {
        for _ in 0..500 {
            if done(a, b) {
                return;
            }
            a.poll(Duration::from_millis(5)).await.unwrap();
            b.poll(Duration::from_millis(5)).await.unwrap();
        }
        panic!("condition not reached");
    }

    fn string_frame(text: &str) -> Vec<u8> {
        crate::frame::PacketWriter::new().put_string(text).finish()
    }

    async fn server_and_client(
        server_policies: AuthPolicies,
        client_policies: AuthPolicies,
        max: u32,
    ) -> (ConnectionManager, ConnectionManager, Shared, Shared, SocketAddr) {
        let server_log = Shared::default();
        let client_log = Shared::default();
        let mut server = manager("server", server_policies);
        server.register_server_protocol("echo", 1, max, Recorder::new(&server_log, "echo"));
        server.set_monitor(MonitorLog(server_log.clone()));
        let addr = server.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut client = manager("client", client_policies);
        client.register_client_protocol("echo", 1, 0, Recorder::new(&client_log, "echo"));
        (server, client, server_log, client_log, addr)
    }

    #[tokio::test]
    async fn test_establish_and_exchange() {
        let (mut server, mut client, server_log, client_log, addr) =
            server_and_client(AuthPolicies::new(), AuthPolicies::new(), 0).await;

        let conn = client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, _| {
            server_log.borrow().opened.len() == 1 && client_log.borrow().opened.len() == 1
        })
        .await;

        let info = client.connection_info(conn).unwrap();
        assert!(info.established);
        assert_eq!(info.peer_module.as_deref(), Some("server"));
        assert_eq!(client.nth_connection("echo", 0), Some(conn));
        assert_eq!(server.connection_count("echo"), 1);

        client.send(conn, &string_frame("ping")).unwrap();
        pump(&mut server, &mut client, |_, _| !client_log.borrow().read.is_empty()).await;
        assert_eq!(server_log.borrow().read, vec!["ping".to_string()]);
        assert_eq!(client_log.borrow().read, vec!["pong".to_string()]);
    }

    #[tokio::test]
    async fn test_encrypted_exchange() {
        let mut policies = AuthPolicies::new();
        policies.set(RAW_PROTOCOL, AuthPolicy::symmetric(SecurityType::Idea, b"k", b""));
        policies.set("echo", AuthPolicy::symmetric(SecurityType::Idea, b"p", b""));
        let (mut server, mut client, _server_log, client_log, addr) =
            server_and_client(policies.clone(), policies, 0).await;

        let conn = client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, _| client_log.borrow().opened.len() == 1).await;
        assert!(client.connection_info(conn).unwrap().encrypted);

        client.send(conn, &string_frame("ping")).unwrap();
        pump(&mut server, &mut client, |_, _| !client_log.borrow().read.is_empty()).await;
        assert_eq!(client_log.borrow().read, vec!["pong".to_string()]);
    }

    #[tokio::test]
    async fn test_wrong_key_never_establishes() {
        let mut server_policies = AuthPolicies::new();
        server_policies.set(RAW_PROTOCOL, AuthPolicy::symmetric(SecurityType::Idea, b"a", b""));
        let mut client_policies = AuthPolicies::new();
        client_policies.set(RAW_PROTOCOL, AuthPolicy::symmetric(SecurityType::Idea, b"b", b""));
        let (mut server, mut client, server_log, client_log, addr) =
            server_and_client(server_policies, client_policies, 0).await;

        client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |s, c| {
            s.connections().is_empty() && c.connections().is_empty()
        })
        .await;
        assert!(server_log.borrow().opened.is_empty());
        assert!(client_log.borrow().opened.is_empty());
        assert_eq!(client.connection_count("echo"), 0);
    }

    #[tokio::test]
    async fn test_limit_reached_rejects_without_callbacks() {
        let (mut server, mut client, server_log, client_log, addr) =
            server_and_client(AuthPolicies::new(), AuthPolicies::new(), 1).await;

        client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, _| server_log.borrow().opened.len() == 1).await;

        let second = client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, c| c.connection_info(second).is_none()).await;

        assert_eq!(server.connection_count("echo"), 1);
        assert_eq!(server_log.borrow().opened.len(), 1);
        assert!(server_log.borrow().closed.is_empty());
        assert_eq!(client_log.borrow().opened.len(), 1);
        assert_eq!(client.connection_count("echo"), 1);
    }

    #[tokio::test]
    async fn test_veto_skips_network() {
        let log = Shared::default();
        let mut client = manager("client", AuthPolicies::new());
        let mut handler = Recorder::new(&log, "echo");
        handler.veto = true;
        client.register_client_protocol("echo", 1, 0, handler);

        // Nothing listens on port 1; a veto must fail before connecting.
        let err = client
            .connect("127.0.0.1:1".parse().unwrap(), "echo")
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Vetoed { .. }));
        assert_eq!(log.borrow().validated, 1);
        assert_eq!(client.connection_count("echo"), 0);
    }

    #[tokio::test]
    async fn test_bad_revision_unlinks_connection() {
        use crate::frame::PacketWriter;
        use crate::handshake::{MAGIC, REVISION};

        let (mut server, _client, server_log, _, addr) =
            server_and_client(AuthPolicies::new(), AuthPolicies::new(), 0).await;
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let hello = PacketWriter::new().put_u32(MAGIC).put_u32(REVISION + 1).finish();
        write_frame(&mut raw, &hello).await.unwrap();
        write_frame(&mut raw, &string_frame("ping")).await.unwrap();

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            loop {
                match read_frame(&mut raw).await {
                    Ok(frame) => frames.push(frame),
                    Err(e) => return (frames, e),
                }
            }
        });
        for _ in 0..400 {
            if reader.is_finished() {
                break;
            }
            server.poll(Duration::from_millis(5)).await.unwrap();
        }
        let (frames, end) = reader.await.unwrap();

        assert_eq!(frames.len(), 1);
        let mut reason = PacketReader::new(frames[0].clone());
        assert_eq!(reason.get_string().unwrap(), "Bad revision number");
        assert!(matches!(end, WireError::ConnectionClosed | WireError::Io(_)));

        assert!(server.connections().is_empty());
        let log = server_log.borrow();
        assert_eq!(log.monitor_closed.len(), 1);
        assert!(log.opened.is_empty());
        assert!(log.read.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_client_protocol() {
        let mut client = manager("client", AuthPolicies::new());
        let err = client
            .connect("127.0.0.1:1".parse().unwrap(), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownProtocol(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_close_order_and_counts() {
        let (mut server, mut client, server_log, _client_log, addr) =
            server_and_client(AuthPolicies::new(), AuthPolicies::new(), 0).await;

        let conn = client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, _| server_log.borrow().opened.len() == 1).await;
        let server_conn = server_log.borrow().opened[0];

        client.close(conn);
        assert!(client.connection_info(conn).is_none());
        pump(&mut server, &mut client, |_, _| !server_log.borrow().closed.is_empty()).await;

        let log = server_log.borrow();
        // on_close already sees the decremented count.
        assert_eq!(log.closed, vec![(server_conn, 0)]);
        assert_eq!(log.monitor_closed, vec![server_conn]);
        assert!(server.connection_info(server_conn).is_none());
    }

    #[tokio::test]
    async fn test_supervisor_loss_is_fatal() {
        let (mut server, mut client, server_log, client_log, addr) =
            server_and_client(AuthPolicies::new(), AuthPolicies::new(), 0).await;

        let conn = client.connect(addr, "echo").await.unwrap();
        pump(&mut server, &mut client, |_, _| client_log.borrow().opened.len() == 1).await;
        client.set_supervisor_link(conn);

        let server_conn = server_log.borrow().opened[0];
        server.close(server_conn);
        let mut result = Ok(0);
        for _ in 0..200 {
            result = client.poll(Duration::from_millis(5)).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(WireError::SupervisorLost(_))));
    }

    #[tokio::test]
    async fn test_wait_until_bounded() {
        let mut m = manager("idle", AuthPolicies::new());
        let started = std::time::Instant::now();
        let done = m
            .wait_until(3, Duration::from_millis(10), || false)
            .await
            .unwrap();
        assert!(!done);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(m.wait_until(3, Duration::from_millis(10), || true).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_event() {
        struct Exits(Rc<RefCell<Vec<ChildExit>>>);
        impl ChildHandler for Exits {
            fn child_exited(&mut self, _cx: &mut Context<'_>, _pid: u32, exit: ChildExit) {
                self.0.borrow_mut().push(exit);
            }
        }
        let exits = Rc::new(RefCell::new(Vec::new()));
        let mut m = manager("parent", AuthPolicies::new());
        m.set_child_handler(Exits(exits.clone()));
        m.spawn_child(Command::new("sh").args(["-c", "exit 3"])).unwrap();
        assert_eq!(m.child_count(), 1);
        let done = m
            .wait_until(200, Duration::from_millis(10), || !exits.borrow().is_empty())
            .await
            .unwrap();
        assert!(done);
        assert_eq!(m.child_count(), 0);
        assert_eq!(exits.borrow()[0], ChildExit::Exited(3));
        assert!(!exits.borrow()[0].success());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_server_protocol_panics() {
        let log = Shared::default();
        let mut m = manager("dup", AuthPolicies::new());
        m.register_server_protocol("echo", 1, 0, Recorder::new(&log, "echo"));
        m.register_server_protocol("echo", 1, 0, Recorder::new(&log, "echo"));
    }
}
