//! Runs an orchestration script.
//!
//! Stages run in a fixed order: start hosts, start modules, make
//! connections, run commands, tear down, then shell cleanup. Every wait is
//! bounded by `attempts * poll_interval`; running out aborts the run. The
//! orchestrator never signals a child: teardown asks modules to exit and
//! waits.

use crate::control::{
    ControlMessage, ControlTarget, SlaveMessage, StdioMessage, CONTROL_ENV, CONTROL_PROTOCOL, FLEET_VERSION,
    SLAVE_PROTOCOL, STDIO_PROTOCOL,
};
use crate::error::{FleetError, FleetResult};
use crate::link::ModuleLink;
use crate::script::{CommandEntry, ConnectionEntry, HostEntry, Item, ModuleEntry, Script};
use modnet_types::{FleetConfig, ModnetConfig, ModnetError};
use modnet_wire::{
    ChildExit, ChildHandler, ConnectionId, ConnectionManager, Context, PacketReader, ProtocolHandler, WireError,
    WireResult,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// A supervised child of the orchestrator or of one of its slave daemons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervised {
    /// Bootstrap command for a host alias.
    Bootstrap(String),
    /// Module by script index.
    Module(usize),
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub modules_started: usize,
    pub exits: Vec<(Supervised, ChildExit)>,
    pub cleanup_ran: bool,
}

impl RunReport {
    /// Every supervised child that exited did so with status 0.
    pub fn all_clean(&self) -> bool {
        self.exits.iter().all(|(_, exit)| exit.success())
    }
}

#[derive(Debug, Default)]
struct ModuleState {
    control: Option<ConnectionId>,
    stdio: Option<ConnectionId>,
    port: Option<u16>,
    /// Connections this module initiated, by protocol.
    established: HashMap<String, u32>,
    /// Last `ConnectFailed` reported since the current request was sent.
    connect_failure: Option<String>,
    failed: Option<String>,
    exit: Option<ChildExit>,
}

impl ModuleState {
    fn registered(&self) -> bool {
        self.control.is_some() && self.stdio.is_some()
    }

    fn established(&self, protocol: &str) -> u32 {
        self.established.get(protocol).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct FleetState {
    aliases: HashSet<String>,
    hosts: HashMap<String, ConnectionId>,
    modules: Vec<ModuleState>,
    /// Local children by pid.
    children: HashMap<u32, Supervised>,
    exits: Vec<(Supervised, ChildExit)>,
}

impl FleetState {
    fn module_mut(&mut self, index: usize) -> WireResult<&mut ModuleState> {
        let count = self.modules.len();
        self.modules
            .get_mut(index)
            .ok_or_else(|| WireError::Handler(format!("module index {index} out of range ({count} modules)")))
    }

    fn record_exit(&mut self, who: Supervised, exit: ChildExit) {
        if let Supervised::Module(index) = who {
            if let Some(module) = self.modules.get_mut(index) {
                module.exit = Some(exit);
            }
        }
        if exit.success() {
            info!(child = ?who, %exit, "Supervised child finished");
        } else {
            warn!(child = ?who, %exit, "Supervised child failed");
        }
        self.exits.push((who, exit));
    }
}

type Shared = Rc<RefCell<FleetState>>;

/// Index recorded on a module's links when it registers.
fn registered_index(cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<usize> {
    cx.info_mut::<usize>(conn)
        .copied()
        .ok_or_else(|| WireError::Handler(format!("message on {conn} before registration")))
}

struct SlaveHub {
    state: Shared,
}

impl ProtocolHandler for SlaveHub {
    fn on_read(&mut self, cx: &mut Context<'_>, conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        let message: SlaveMessage = packet.take_json()?;
        let mut state = self.state.borrow_mut();
        match message {
            SlaveMessage::Register { alias } => {
                if !state.aliases.contains(&alias) {
                    return Err(WireError::Handler(format!("unknown host alias {alias}")));
                }
                info!(alias = %alias, %conn, "Host registered");
                state.hosts.insert(alias.clone(), conn);
                cx.set_info(conn, alias)?;
            }
            SlaveMessage::ModuleStarted { index, pid } => {
                info!(index, pid, "Remote module started");
            }
            SlaveMessage::ModuleFailed { index, reason } => {
                state.module_mut(index)?.failed = Some(reason);
            }
            SlaveMessage::ModuleExited { index, exit } => {
                state.module_mut(index)?;
                state.record_exit(Supervised::Module(index), exit.into());
            }
            other => warn!(message = ?other, "Unexpected message from slave daemon"),
        }
        Ok(())
    }

    fn on_close(&mut self, cx: &mut Context<'_>, conn: ConnectionId) {
        if let Some(alias) = cx.info_mut::<String>(conn).cloned() {
            info!(alias = %alias, "Host disconnected");
            self.state.borrow_mut().hosts.remove(&alias);
        }
    }
}

struct ControlHub {
    state: Shared,
}

impl ProtocolHandler for ControlHub {
    fn on_read(&mut self, cx: &mut Context<'_>, conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        let message: ControlMessage = packet.take_json()?;
        let mut state = self.state.borrow_mut();
        if let ControlMessage::Register { index } = message {
            state.module_mut(index)?.control = Some(conn);
            cx.set_info(conn, index)?;
            info!(index, %conn, "Module control link registered");
            return Ok(());
        }

        let index = registered_index(cx, conn)?;
        let module = state.module_mut(index)?;
        match message {
            ControlMessage::ListenPort { port } => {
                info!(index, port, "Module listening");
                module.port = Some(port);
            }
            ControlMessage::Established {
                protocol,
                peer_module,
                initiated,
            } => {
                info!(index, protocol = %protocol, peer_module = %peer_module, initiated, "Module connection established");
                if initiated {
                    *module.established.entry(protocol).or_default() += 1;
                }
            }
            ControlMessage::Closed { protocol, initiated } => {
                info!(index, protocol = %protocol, initiated, "Module connection closed");
            }
            ControlMessage::ConnectFailed {
                host,
                port,
                protocol,
                reason,
            } => {
                warn!(index, host = %host, port, protocol = %protocol, reason = %reason, "Module could not connect");
                module.connect_failure = Some(reason);
            }
            other => warn!(index, message = ?other, "Unexpected control message"),
        }
        Ok(())
    }

    fn on_close(&mut self, cx: &mut Context<'_>, conn: ConnectionId) {
        if let Some(index) = cx.info_mut::<usize>(conn).copied() {
            if let Some(module) = self.state.borrow_mut().modules.get_mut(index) {
                module.control = None;
            }
        }
    }
}

struct StdioHub {
    state: Shared,
}

impl ProtocolHandler for StdioHub {
    fn on_read(&mut self, cx: &mut Context<'_>, conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        match packet.take_json::<StdioMessage>()? {
            StdioMessage::Register { index } => {
                self.state.borrow_mut().module_mut(index)?.stdio = Some(conn);
                cx.set_info(conn, index)?;
            }
            StdioMessage::Line { text } => {
                let index = registered_index(cx, conn)?;
                info!(module = index, "{text}");
            }
        }
        Ok(())
    }

    fn on_close(&mut self, cx: &mut Context<'_>, conn: ConnectionId) {
        if let Some(index) = cx.info_mut::<usize>(conn).copied() {
            if let Some(module) = self.state.borrow_mut().modules.get_mut(index) {
                module.stdio = None;
            }
        }
    }
}

struct Reaper {
    state: Shared,
}

impl ChildHandler for Reaper {
    fn child_exited(&mut self, _cx: &mut Context<'_>, pid: u32, exit: ChildExit) {
        let mut state = self.state.borrow_mut();
        if let Some(who) = state.children.remove(&pid) {
            state.record_exit(who, exit);
        }
    }
}

/// Substitute `{host}`, `{address}`, `{port}`, `{alias}` and `{display}`.
pub fn expand_bootstrap(template: &str, host: &HostEntry, address: &str, port: u16, display: &str) -> String {
    template
        .replace("{host}", &host.hostname)
        .replace("{address}", address)
        .replace("{port}", &port.to_string())
        .replace("{alias}", &host.alias)
        .replace("{display}", display)
}

/// One orchestration run over one script.
pub struct Orchestrator {
    manager: ConnectionManager,
    fleet: FleetConfig,
    script: Script,
    state: Shared,
    listen: SocketAddr,
    port: u16,
    modules_started: usize,
    /// Set when this orchestrator is itself supervised.
    outer: Option<ModuleLink>,
}

impl Orchestrator {
    pub fn new(config: &ModnetConfig, script: Script) -> FleetResult<Self> {
        let listen: SocketAddr = config.wire.listen_addr.parse().map_err(|_| {
            ModnetError::Config(format!("wire.listen_addr is not a socket address: {}", config.wire.listen_addr))
        })?;
        let mut manager = ConnectionManager::from_config(config)?;

        let state = Rc::new(RefCell::new(FleetState {
            aliases: script
                .hosts
                .iter()
                .filter_map(|item| match item {
                    Item::Entry(h) => Some(h.alias.clone()),
                    Item::Shell(_) => None,
                })
                .collect(),
            modules: (0..script.module_count()).map(|_| ModuleState::default()).collect(),
            ..Default::default()
        }));
        manager.register_server_protocol(SLAVE_PROTOCOL, FLEET_VERSION, 0, SlaveHub { state: state.clone() });
        manager.register_server_protocol(CONTROL_PROTOCOL, FLEET_VERSION, 0, ControlHub { state: state.clone() });
        manager.register_server_protocol(STDIO_PROTOCOL, FLEET_VERSION, 0, StdioHub { state: state.clone() });
        manager.set_child_handler(Reaper { state: state.clone() });

        let outer = ControlTarget::from_env()?.map(|target| {
            info!(index = target.index, "Running under an outer orchestrator");
            ModuleLink::install(&mut manager, target)
        });

        Ok(Self {
            manager,
            fleet: config.fleet.clone(),
            script,
            state,
            listen,
            port: 0,
            modules_started: 0,
            outer,
        })
    }

    pub fn modules_started(&self) -> usize {
        self.modules_started
    }

    /// Port of the orchestrator's listener, once running.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run every stage. Teardown runs even after an aborted stage; shell
    /// cleanup runs only after a clean run.
    pub async fn run(&mut self) -> FleetResult<RunReport> {
        let local = self.manager.serve(self.listen).await?;
        self.port = local.port();
        if let Some(outer) = self.outer.clone() {
            outer.connect(&mut self.manager).await?;
        }

        let staged = self.stages().await;
        if let Err(e) = &staged {
            error!(error = %e, "Orchestration aborted");
        }
        let torn_down = self.teardown().await;
        staged?;
        torn_down?;

        let cleanup_ran = self.shell_cleanup().await?;
        let state = self.state.borrow();
        Ok(RunReport {
            modules_started: self.modules_started,
            exits: state.exits.clone(),
            cleanup_ran,
        })
    }

    async fn stages(&mut self) -> FleetResult<()> {
        self.startup_hosts().await?;
        self.startup_modules().await?;
        self.make_connections().await?;
        self.run_commands().await?;
        for command in self.script.trailing.clone() {
            self.run_shell(&command).await?;
        }
        Ok(())
    }

    fn interval(&self) -> Duration {
        self.fleet.poll_interval()
    }

    /// Address other hosts use to reach this orchestrator.
    fn advertise_host(&self) -> String {
        if let Some(host) = &self.fleet.advertise_host {
            return host.clone();
        }
        if self.listen.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            self.listen.ip().to_string()
        }
    }

    async fn run_shell(&mut self, command: &str) -> FleetResult<()> {
        info!(command, "Running shell command");
        let status = Command::new("sh").arg("-c").arg(command).status().await?;
        if !status.success() {
            warn!(command, %status, "Shell command failed");
        }
        Ok(())
    }

    async fn startup_hosts(&mut self) -> FleetResult<()> {
        for item in self.script.hosts.clone() {
            match item {
                Item::Shell(command) => self.run_shell(&command).await?,
                Item::Entry(host) => self.start_host(&host).await?,
            }
        }
        Ok(())
    }

    async fn start_host(&mut self, host: &HostEntry) -> FleetResult<()> {
        let line = expand_bootstrap(
            &self.fleet.bootstrap_command,
            host,
            &self.advertise_host(),
            self.port,
            self.fleet.display.as_deref().unwrap_or(""),
        );
        info!(alias = %host.alias, host = %host.hostname, "Bootstrapping host");
        let pid = self.manager.spawn_child(Command::new("sh").arg("-c").arg(&line))?;
        self.state
            .borrow_mut()
            .children
            .insert(pid, Supervised::Bootstrap(host.alias.clone()));

        let state = self.state.clone();
        let registered = self
            .manager
            .wait_until(self.fleet.host_wait_attempts, self.interval(), || {
                state.borrow().hosts.contains_key(&host.alias)
            })
            .await?;
        if !registered {
            return Err(FleetError::HostTimeout {
                alias: host.alias.clone(),
                hostname: host.hostname.clone(),
            });
        }
        Ok(())
    }

    async fn startup_modules(&mut self) -> FleetResult<()> {
        let mut index = 0;
        for item in self.script.modules.clone() {
            match item {
                Item::Shell(command) => self.run_shell(&command).await?,
                Item::Entry(module) => {
                    self.start_module(index, &module).await?;
                    index += 1;
                }
            }
        }
        Ok(())
    }

    async fn start_module(&mut self, index: usize, module: &ModuleEntry) -> FleetResult<()> {
        let failed = |reason: String| FleetError::ModuleFailed {
            index,
            program: module.program.clone(),
            reason,
        };
        let mut target = ControlTarget {
            host: "127.0.0.1".to_string(),
            port: self.port,
            index,
            placement: module.placement.clone(),
        };

        match &module.host {
            None => {
                let mut command = Command::new(&module.program);
                command.args(&module.args).env(CONTROL_ENV, target.to_env_value());
                if let Some(display) = &self.fleet.display {
                    command.env("DISPLAY", display);
                }
                let pid = self
                    .manager
                    .spawn_child(&mut command)
                    .map_err(|e| failed(e.to_string()))?;
                self.state.borrow_mut().children.insert(pid, Supervised::Module(index));
                info!(index, program = %module.program, pid, "Started local module");
            }
            Some(alias) => {
                let Some(conn) = self.state.borrow().hosts.get(alias).copied() else {
                    return Err(failed(format!("host {alias} is not registered")));
                };
                target.host = self.advertise_host();
                self.manager.send_json(
                    conn,
                    &SlaveMessage::StartModule {
                        index,
                        program: module.program.clone(),
                        args: module.args.clone(),
                        control: target.to_env_value(),
                    },
                )?;
                info!(index, program = %module.program, host = %alias, "Requested remote module");
            }
        }
        self.modules_started += 1;

        let state = self.state.clone();
        let settled = self
            .manager
            .wait_until(self.fleet.module_wait_attempts, self.interval(), || {
                let s = state.borrow();
                let m = &s.modules[index];
                m.registered() || m.failed.is_some() || m.exit.is_some()
            })
            .await?;

        let stdio = {
            let s = self.state.borrow();
            let m = &s.modules[index];
            match (m.registered(), &m.failed, m.exit) {
                (true, _, _) => m.stdio,
                (false, Some(reason), _) => return Err(failed(reason.clone())),
                (false, None, Some(exit)) => return Err(failed(format!("{exit} before registering"))),
                (false, None, None) => {
                    debug_assert!(!settled);
                    return Err(FleetError::ModuleTimeout {
                        index,
                        program: module.program.clone(),
                    });
                }
            }
        };

        if let Some(stdio) = stdio {
            for line in &module.defaults {
                self.manager
                    .send_json(stdio, &StdioMessage::Line { text: line.clone() })?;
            }
        }
        Ok(())
    }

    async fn make_connections(&mut self) -> FleetResult<()> {
        for item in self.script.connections.clone() {
            match item {
                Item::Shell(command) => self.run_shell(&command).await?,
                Item::Entry(entry) => self.connect_modules(&entry).await?,
            }
        }
        Ok(())
    }

    /// Host the client module should dial to reach the server module.
    fn server_host(&self, entry: &ConnectionEntry, server_control: ConnectionId) -> String {
        let peer = self
            .manager
            .connection_info(server_control)
            .map(|info| info.peer_addr.ip());
        let same_host = self.script.module(entry.client).map(|m| &m.host) == self.script.module(entry.server).map(|m| &m.host);
        match peer {
            Some(ip) if ip.is_loopback() && !same_host => self.advertise_host(),
            Some(ip) => ip.to_string(),
            None => self.advertise_host(),
        }
    }

    async fn connect_modules(&mut self, entry: &ConnectionEntry) -> FleetResult<()> {
        let state = self.state.clone();
        let published = self
            .manager
            .wait_until(self.fleet.port_wait_attempts, self.interval(), || {
                state.borrow().modules[entry.server].port.is_some()
            })
            .await?;
        if !published {
            return Err(FleetError::PortTimeout { index: entry.server });
        }

        let (port, server_control, client_control, before) = {
            let mut s = self.state.borrow_mut();
            s.modules[entry.client].connect_failure = None;
            let server = &s.modules[entry.server];
            let client = &s.modules[entry.client];
            (
                server.port.unwrap_or_default(),
                server.control,
                client.control,
                client.established(&entry.protocol),
            )
        };
        let lost = |index: usize| FleetError::ModuleFailed {
            index,
            program: self.script.module(index).map(|m| m.program.clone()).unwrap_or_default(),
            reason: "control link closed".to_string(),
        };
        let server_control = server_control.ok_or_else(|| lost(entry.server))?;
        let client_control = client_control.ok_or_else(|| lost(entry.client))?;

        let host = self.server_host(entry, server_control);
        info!(
            client = entry.client,
            server = entry.server,
            protocol = %entry.protocol,
            host = %host,
            port,
            "Requesting connection"
        );
        self.manager.send_json(
            client_control,
            &ControlMessage::Connect {
                host,
                port,
                protocol: entry.protocol.clone(),
            },
        )?;

        let settled = self
            .manager
            .wait_until(self.fleet.connection_wait_attempts, self.interval(), || {
                let s = state.borrow();
                let client = &s.modules[entry.client];
                client.established(&entry.protocol) > before || client.connect_failure.is_some()
            })
            .await?;
        let (established, failure) = {
            let s = self.state.borrow();
            let client = &s.modules[entry.client];
            (client.established(&entry.protocol) > before, client.connect_failure.clone())
        };
        if let (false, Some(reason)) = (established, failure) {
            return Err(FleetError::ConnectFailed {
                client: entry.client,
                server: entry.server,
                protocol: entry.protocol.clone(),
                reason,
            });
        }
        if !settled || !established {
            return Err(FleetError::ConnectionTimeout {
                client: entry.client,
                server: entry.server,
                protocol: entry.protocol.clone(),
            });
        }
        Ok(())
    }

    async fn run_commands(&mut self) -> FleetResult<()> {
        let mut delay = Duration::from_millis(self.fleet.command_delay_ms);
        for item in self.script.commands.clone() {
            if self.manager.shutdown_requested() {
                info!("Shutdown requested, skipping remaining commands");
                break;
            }
            match item {
                Item::Shell(command) => self.run_shell(&command).await?,
                Item::Entry(CommandEntry::Delay(new_delay)) => {
                    delay = new_delay;
                    continue;
                }
                Item::Entry(CommandEntry::Send { module, text }) => {
                    let stdio = self.state.borrow().modules[module].stdio;
                    match stdio {
                        Some(stdio) => self.manager.send_json(stdio, &StdioMessage::Line { text })?,
                        None => warn!(module, "Module has no stdio link, dropping command"),
                    }
                }
            }
            self.manager.poll_for(delay).await?;
        }
        Ok(())
    }

    /// Ask every daemon and module to exit, then wait for local children.
    async fn teardown(&mut self) -> FleetResult<()> {
        let (hosts, controls): (Vec<ConnectionId>, Vec<ConnectionId>) = {
            let s = self.state.borrow();
            (
                s.hosts.values().copied().collect(),
                s.modules.iter().filter_map(|m| m.control).collect(),
            )
        };
        for conn in hosts {
            if let Err(e) = self.manager.send_json(conn, &SlaveMessage::Shutdown) {
                warn!(%conn, error = %e, "Failed to stop slave daemon");
            }
            self.manager.close(conn);
        }
        for conn in controls {
            if let Err(e) = self.manager.send_json(conn, &ControlMessage::Shutdown) {
                warn!(%conn, error = %e, "Failed to stop module");
            }
        }

        let state = self.state.clone();
        let drained = self
            .manager
            .wait_until(self.fleet.teardown_wait_attempts, self.interval(), || {
                state.borrow().children.is_empty()
            })
            .await?;
        if !drained {
            let remaining = self.state.borrow().children.len();
            error!(remaining, "Supervised children did not exit");
            return Err(FleetError::TeardownTimeout(remaining));
        }
        info!("Teardown complete");
        Ok(())
    }

    /// Returns whether cleanup ran.
    async fn shell_cleanup(&mut self) -> FleetResult<bool> {
        if self.script.cleanup.is_empty() {
            return Ok(false);
        }
        let clean = self.state.borrow().exits.iter().all(|(_, exit)| exit.success());
        if !clean {
            warn!("Skipping shell cleanup after a failed child");
            return Ok(false);
        }
        for command in self.script.cleanup.clone() {
            self.run_shell(&command).await?;
        }
        Ok(true)
    }
}
