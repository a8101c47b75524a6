//! Messages on the orchestrator's three protocols.
//!
//! All three are served by the orchestrator. Payloads are JSON, one message
//! per frame.

use crate::error::{FleetError, FleetResult};
use modnet_wire::ChildExit;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

/// Slave daemons register here and launch modules on request.
pub const SLAVE_PROTOCOL: &str = "modnet_slave";
/// Modules register, publish their port and take `Connect`/`Shutdown`.
pub const CONTROL_PROTOCOL: &str = "modnet_control";
/// Line-oriented text to and from modules.
pub const STDIO_PROTOCOL: &str = "modnet_stdio";
pub const FLEET_VERSION: u32 = 1;

/// Environment variable telling a module where its orchestrator is.
pub const CONTROL_ENV: &str = "MODNET_CONTROL_COMMAND";

/// How a child ended, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitReport {
    Exited(i32),
    Signaled(i32),
}

impl From<ChildExit> for ExitReport {
    fn from(exit: ChildExit) -> Self {
        match exit {
            ChildExit::Exited(code) => ExitReport::Exited(code),
            ChildExit::Signaled(signal) => ExitReport::Signaled(signal),
        }
    }
}

impl From<ExitReport> for ChildExit {
    fn from(exit: ExitReport) -> Self {
        match exit {
            ExitReport::Exited(code) => ChildExit::Exited(code),
            ExitReport::Signaled(signal) => ChildExit::Signaled(signal),
        }
    }
}

/// Traffic between the orchestrator and a slave daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlaveMessage {
    /// Daemon to orchestrator, once connected.
    Register { alias: String },
    /// Orchestrator to daemon.
    StartModule {
        index: usize,
        program: String,
        args: Vec<String>,
        /// Value for [`CONTROL_ENV`].
        control: String,
    },
    ModuleStarted { index: usize, pid: u32 },
    ModuleFailed { index: usize, reason: String },
    ModuleExited { index: usize, exit: ExitReport },
    /// Orchestrator to daemon: exit.
    Shutdown,
}

/// Traffic between the orchestrator and a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Module to orchestrator, first message on the link.
    Register { index: usize },
    /// Module to orchestrator: its listener is bound.
    ListenPort { port: u16 },
    /// Module to orchestrator: an application connection finished its handshake.
    Established {
        protocol: String,
        peer_module: String,
        initiated: bool,
    },
    /// Module to orchestrator: an application connection went away.
    Closed { protocol: String, initiated: bool },
    /// Module to orchestrator: a requested connection could not be started.
    ConnectFailed {
        host: String,
        port: u16,
        protocol: String,
        reason: String,
    },
    /// Orchestrator to module: open a client connection.
    Connect {
        host: String,
        port: u16,
        protocol: String,
    },
    /// Orchestrator to module: exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StdioMessage {
    Register { index: usize },
    Line { text: String },
}

/// Parsed value of [`CONTROL_ENV`]: `<host>:<port>:<module-index>:<placement>`.
///
/// The host may itself contain colons; placement may not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTarget {
    pub host: String,
    pub port: u16,
    pub index: usize,
    pub placement: Option<String>,
}

impl ControlTarget {
    pub fn parse(value: &str) -> FleetResult<Self> {
        let bad = || FleetError::ControlEnv(value.to_string());
        let mut parts = value.rsplitn(4, ':');
        let placement = parts.next().ok_or_else(bad)?;
        let index = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let port = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(bad)?;
        Ok(Self {
            host: host.to_string(),
            port,
            index,
            placement: (!placement.is_empty() && placement != "-").then(|| placement.to_string()),
        })
    }

    /// Read [`CONTROL_ENV`]; `None` when this process is not supervised.
    pub fn from_env() -> FleetResult<Option<Self>> {
        match std::env::var(CONTROL_ENV) {
            Ok(value) => Self::parse(&value).map(Some),
            Err(_) => Ok(None),
        }
    }

    pub fn to_env_value(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.host,
            self.port,
            self.index,
            self.placement.as_deref().unwrap_or("-")
        )
    }

    pub fn resolve(&self) -> FleetResult<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

/// First address for `host:port`. May block on name resolution.
pub fn resolve(host: &str, port: u16) -> FleetResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| FleetError::ControlEnv(format!("{host}:{port} does not resolve")))
}
