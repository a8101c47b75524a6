//! Orchestration error types.

use crate::script::ScriptError;
use modnet_types::ModnetError;
use modnet_wire::WireError;
use thiserror::Error;

/// Errors that end an orchestration run or a fleet helper process.
#[derive(Error, Debug)]
pub enum FleetError {
    /// A wrapped ModnetError.
    #[error(transparent)]
    Modnet(#[from] ModnetError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    /// A slave daemon never registered.
    #[error("Host {alias} ({hostname}) did not register")]
    HostTimeout { alias: String, hostname: String },

    /// A module never opened its control and stdio links.
    #[error("Module {index} ({program}) did not register")]
    ModuleTimeout { index: usize, program: String },

    /// A module could not be launched or exited before registering.
    #[error("Module {index} ({program}) failed: {reason}")]
    ModuleFailed {
        index: usize,
        program: String,
        reason: String,
    },

    /// A server module never published its listening port.
    #[error("Module {index} did not publish a listening port")]
    PortTimeout { index: usize },

    #[error("Connection from module {client} to module {server} ({protocol}) was not established")]
    ConnectionTimeout {
        client: usize,
        server: usize,
        protocol: String,
    },

    /// The client module reported that it could not dial the server.
    #[error("Module {client} could not connect to module {server} ({protocol}): {reason}")]
    ConnectFailed {
        client: usize,
        server: usize,
        protocol: String,
        reason: String,
    },

    /// Supervised children outlived the teardown wait.
    #[error("{0} supervised children still running after shutdown")]
    TeardownTimeout(usize),

    /// `MODNET_CONTROL_COMMAND` is malformed.
    #[error("Bad control variable: {0}")]
    ControlEnv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for fleet results.
pub type FleetResult<T> = Result<T, FleetError>;

impl From<FleetError> for ModnetError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::Modnet(inner) => inner,
            FleetError::Io(inner) => ModnetError::Io(inner),
            other => ModnetError::Orchestration(other.to_string()),
        }
    }
}
