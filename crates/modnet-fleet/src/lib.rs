//! Script-driven orchestration of modnet modules.
//!
//! An [`Orchestrator`] reads a [`Script`], bootstraps a [`SlaveDaemon`] on
//! every remote host, starts modules locally or through the daemons, wires
//! them together, feeds them commands and tears everything down again.
//! Modules find their way back through [`ModuleLink`].

pub mod config;
pub mod control;
pub mod error;
pub mod link;
pub mod orchestrator;
pub mod script;
pub mod slave;

pub use config::{default_config_path, load_config};
pub use control::{ControlTarget, CONTROL_ENV};
pub use error::{FleetError, FleetResult};
pub use link::ModuleLink;
pub use orchestrator::{Orchestrator, RunReport, Supervised};
pub use script::{Script, ScriptError};
pub use slave::SlaveDaemon;
