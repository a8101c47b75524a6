//! The module side of orchestration.
//!
//! A module started by an orchestrator finds [`CONTROL_ENV`] in its
//! environment, connects back on `modnet_control` and `modnet_stdio`,
//! registers its index, publishes its listening port and then follows
//! orders. Losing the control link ends the module's event loop.
//!
//! [`CONTROL_ENV`]: crate::control::CONTROL_ENV

use crate::control::{
    resolve, ControlMessage, ControlTarget, StdioMessage, CONTROL_PROTOCOL, FLEET_VERSION, STDIO_PROTOCOL,
};
use crate::error::FleetResult;
use modnet_wire::{
    ConnectionId, ConnectionInfo, ConnectionManager, ConnectionMonitor, ConnectionSide, Context, PacketReader,
    ProtocolHandler, WireError, WireResult,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LinkState {
    index: usize,
    control: Option<ConnectionId>,
    stdio: Option<ConnectionId>,
    port: Option<u16>,
    lines: VecDeque<String>,
}

impl LinkState {
    fn is_link(&self, protocol: &str) -> bool {
        protocol == CONTROL_PROTOCOL || protocol == STDIO_PROTOCOL
    }

    fn report(&self, cx: &mut Context<'_>, message: &ControlMessage) {
        let Some(control) = self.control else {
            return;
        };
        if let Err(e) = cx.send_json(control, message) {
            warn!(error = %e, "Failed to report to orchestrator");
        }
    }
}

/// Handle on a module's link to its orchestrator.
#[derive(Clone)]
pub struct ModuleLink {
    target: ControlTarget,
    state: Rc<RefCell<LinkState>>,
}

impl ModuleLink {
    /// Register the link's client protocols and connection monitor.
    ///
    /// Call before [`ConnectionManager::serve`] so the port gets published.
    pub fn install(manager: &mut ConnectionManager, target: ControlTarget) -> Self {
        let state = Rc::new(RefCell::new(LinkState {
            index: target.index,
            ..Default::default()
        }));
        manager.register_client_protocol(
            CONTROL_PROTOCOL,
            FLEET_VERSION,
            1,
            ControlHandler {
                state: state.clone(),
            },
        );
        manager.register_client_protocol(
            STDIO_PROTOCOL,
            FLEET_VERSION,
            1,
            StdioHandler {
                state: state.clone(),
            },
        );
        manager.set_monitor(LinkMonitor {
            state: state.clone(),
        });
        Self { target, state }
    }

    /// Open both links to the orchestrator.
    pub async fn connect(&self, manager: &mut ConnectionManager) -> FleetResult<()> {
        let addr = self.target.resolve()?;
        info!(%addr, index = self.target.index, "Connecting to orchestrator");
        manager.connect(addr, CONTROL_PROTOCOL).await?;
        manager.connect(addr, STDIO_PROTOCOL).await?;
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.target.index
    }

    pub fn placement(&self) -> Option<&str> {
        self.target.placement.as_deref()
    }

    /// Both links finished their handshake.
    pub fn is_registered(&self) -> bool {
        let state = self.state.borrow();
        state.control.is_some() && state.stdio.is_some()
    }

    /// Next line received on the stdio link.
    pub fn next_line(&self) -> Option<String> {
        self.state.borrow_mut().lines.pop_front()
    }

    /// Send one line of output to the orchestrator.
    pub fn print(&self, cx: &mut Context<'_>, text: &str) -> WireResult<()> {
        let Some(stdio) = self.state.borrow().stdio else {
            return Err(WireError::Handler("stdio link is not open".to_string()));
        };
        cx.send_json(
            stdio,
            &StdioMessage::Line {
                text: text.to_string(),
            },
        )
    }
}

struct ControlHandler {
    state: Rc<RefCell<LinkState>>,
}

impl ProtocolHandler for ControlHandler {
    fn on_open(&mut self, cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
        cx.set_supervisor_link(conn);
        let mut state = self.state.borrow_mut();
        state.control = Some(conn);
        cx.send_json(conn, &ControlMessage::Register { index: state.index })?;
        if let Some(port) = state.port {
            cx.send_json(conn, &ControlMessage::ListenPort { port })?;
        }
        Ok(())
    }

    fn on_read(&mut self, cx: &mut Context<'_>, _conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        match packet.take_json::<ControlMessage>()? {
            ControlMessage::Connect { host, port, protocol } => match resolve(&host, port) {
                Ok(addr) => {
                    debug!(%addr, protocol = %protocol, "Orchestrator requested connection");
                    cx.connect(addr, protocol);
                }
                Err(e) => {
                    warn!(host = %host, port, protocol = %protocol, error = %e, "Cannot resolve requested peer");
                    self.state.borrow().report(
                        cx,
                        &ControlMessage::ConnectFailed {
                            host,
                            port,
                            protocol,
                            reason: e.to_string(),
                        },
                    );
                }
            },
            ControlMessage::Shutdown => {
                info!("Orchestrator requested shutdown");
                cx.request_shutdown();
            }
            other => warn!(message = ?other, "Unexpected control message"),
        }
        Ok(())
    }
}

struct StdioHandler {
    state: Rc<RefCell<LinkState>>,
}

impl ProtocolHandler for StdioHandler {
    fn on_open(&mut self, cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
        let mut state = self.state.borrow_mut();
        state.stdio = Some(conn);
        cx.send_json(conn, &StdioMessage::Register { index: state.index })
    }

    fn on_read(&mut self, _cx: &mut Context<'_>, _conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        match packet.take_json::<StdioMessage>()? {
            StdioMessage::Line { text } => self.state.borrow_mut().lines.push_back(text),
            StdioMessage::Register { .. } => warn!("Unexpected stdio registration"),
        }
        Ok(())
    }

    fn on_close(&mut self, _cx: &mut Context<'_>, _conn: ConnectionId) {
        self.state.borrow_mut().stdio = None;
    }
}

/// Publishes the port and reports application connections.
struct LinkMonitor {
    state: Rc<RefCell<LinkState>>,
}

impl ConnectionMonitor for LinkMonitor {
    fn listening(&mut self, cx: &mut Context<'_>, port: u16) {
        let mut state = self.state.borrow_mut();
        state.port = Some(port);
        state.report(cx, &ControlMessage::ListenPort { port });
    }

    fn connection_opened(&mut self, cx: &mut Context<'_>, info: &ConnectionInfo) {
        let state = self.state.borrow();
        if state.is_link(&info.protocol) {
            return;
        }
        state.report(
            cx,
            &ControlMessage::Established {
                protocol: info.protocol.clone(),
                peer_module: info.peer_module.clone().unwrap_or_default(),
                initiated: info.side == ConnectionSide::Client,
            },
        );
    }

    fn connection_closed(&mut self, cx: &mut Context<'_>, info: &ConnectionInfo) {
        let state = self.state.borrow();
        if !info.established || state.is_link(&info.protocol) {
            return;
        }
        state.report(
            cx,
            &ControlMessage::Closed {
                protocol: info.protocol.clone(),
                initiated: info.side == ConnectionSide::Client,
            },
        );
    }

    fn connect_failed(&mut self, cx: &mut Context<'_>, addr: SocketAddr, protocol: &str, error: &WireError) {
        warn!(%addr, protocol, error = %error, "Requested connection failed");
        self.state.borrow().report(
            cx,
            &ControlMessage::ConnectFailed {
                host: addr.ip().to_string(),
                port: addr.port(),
                protocol: protocol.to_string(),
                reason: error.to_string(),
            },
        );
    }
}
