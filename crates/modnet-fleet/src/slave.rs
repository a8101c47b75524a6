//! The per-host slave daemon.
//!
//! Started on a remote host by the orchestrator's bootstrap command. It
//! connects back, registers its alias, launches modules on request and
//! reports their fate. It exits on `Shutdown` or when the orchestrator goes
//! away.

use crate::control::{SlaveMessage, CONTROL_ENV, FLEET_VERSION, SLAVE_PROTOCOL};
use crate::error::FleetResult;
use modnet_types::ModnetConfig;
use modnet_wire::{
    ChildExit, ChildHandler, ConnectionId, ConnectionManager, Context, PacketReader, ProtocolHandler, WireError,
    WireResult,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const LINK_WAIT_ATTEMPTS: u32 = 100;
const LINK_WAIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct DaemonState {
    alias: String,
    display: Option<String>,
    link: Option<ConnectionId>,
    /// pid to module index.
    modules: HashMap<u32, usize>,
}

impl DaemonState {
    fn send(&self, cx: &mut Context<'_>, message: &SlaveMessage) {
        let Some(link) = self.link else {
            warn!(?message, "No orchestrator link, dropping report");
            return;
        };
        if let Err(e) = cx.send_json(link, message) {
            warn!(error = %e, "Failed to report to orchestrator");
        }
    }

    fn start_module(&mut self, cx: &mut Context<'_>, index: usize, program: &str, args: &[String], control: &str) {
        let mut command = Command::new(program);
        command.args(args).env(CONTROL_ENV, control);
        if let Some(display) = &self.display {
            command.env("DISPLAY", display);
        }
        let report = match cx.spawn_child(&mut command) {
            Ok(pid) => {
                info!(index, program, pid, "Module started");
                self.modules.insert(pid, index);
                SlaveMessage::ModuleStarted { index, pid }
            }
            Err(e) => {
                warn!(index, program, error = %e, "Module failed to start");
                SlaveMessage::ModuleFailed {
                    index,
                    reason: e.to_string(),
                }
            }
        };
        self.send(cx, &report);
    }
}

struct SlaveLink {
    state: Rc<RefCell<DaemonState>>,
}

impl ProtocolHandler for SlaveLink {
    fn on_open(&mut self, cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
        cx.set_supervisor_link(conn);
        let mut state = self.state.borrow_mut();
        state.link = Some(conn);
        cx.send_json(
            conn,
            &SlaveMessage::Register {
                alias: state.alias.clone(),
            },
        )
    }

    fn on_read(&mut self, cx: &mut Context<'_>, _conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        match packet.take_json::<SlaveMessage>()? {
            SlaveMessage::StartModule {
                index,
                program,
                args,
                control,
            } => self
                .state
                .borrow_mut()
                .start_module(cx, index, &program, &args, &control),
            SlaveMessage::Shutdown => {
                info!("Orchestrator requested shutdown");
                cx.request_shutdown();
            }
            other => warn!(message = ?other, "Unexpected message from orchestrator"),
        }
        Ok(())
    }
}

struct ModuleReaper {
    state: Rc<RefCell<DaemonState>>,
}

impl ChildHandler for ModuleReaper {
    fn child_exited(&mut self, cx: &mut Context<'_>, pid: u32, exit: ChildExit) {
        let mut state = self.state.borrow_mut();
        let Some(index) = state.modules.remove(&pid) else {
            return;
        };
        state.send(
            cx,
            &SlaveMessage::ModuleExited {
                index,
                exit: exit.into(),
            },
        );
    }
}

/// A slave daemon bound to one orchestrator.
pub struct SlaveDaemon {
    manager: ConnectionManager,
    orchestrator: SocketAddr,
    state: Rc<RefCell<DaemonState>>,
}

impl SlaveDaemon {
    pub fn new(config: &ModnetConfig, orchestrator: SocketAddr, alias: &str, display: Option<String>) -> FleetResult<Self> {
        let mut manager = ConnectionManager::from_config(config)?;
        let state = Rc::new(RefCell::new(DaemonState {
            alias: alias.to_string(),
            display,
            ..Default::default()
        }));
        manager.register_client_protocol(
            SLAVE_PROTOCOL,
            FLEET_VERSION,
            1,
            SlaveLink {
                state: state.clone(),
            },
        );
        manager.set_child_handler(ModuleReaper {
            state: state.clone(),
        });
        Ok(Self {
            manager,
            orchestrator,
            state,
        })
    }

    /// Connect and serve until told to stop or the orchestrator disappears.
    pub async fn run(mut self) -> FleetResult<()> {
        let alias = self.state.borrow().alias.clone();
        info!(alias = %alias, orchestrator = %self.orchestrator, "Slave daemon starting");
        self.manager.connect(self.orchestrator, SLAVE_PROTOCOL).await?;
        let state = self.state.clone();
        let linked = self
            .manager
            .wait_until(LINK_WAIT_ATTEMPTS, LINK_WAIT_INTERVAL, || state.borrow().link.is_some())
            .await?;
        if !linked {
            return Err(WireError::Handler("orchestrator link did not establish".to_string()).into());
        }
        match self.manager.run().await {
            Ok(()) => Ok(()),
            Err(WireError::SupervisorLost(reason)) => {
                info!(alias = %alias, reason = %reason, "Orchestrator went away, exiting");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modnet_types::SameHostPolicy;
    use modnet_wire::AuthPolicies;

    #[derive(Default)]
    struct Seen {
        link: Option<ConnectionId>,
        messages: Vec<SlaveMessage>,
    }

    struct FakeOrchestrator(Rc<RefCell<Seen>>);

    impl ProtocolHandler for FakeOrchestrator {
        fn on_open(&mut self, _cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
            self.0.borrow_mut().link = Some(conn);
            Ok(())
        }

        fn on_read(&mut self, _cx: &mut Context<'_>, _conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
            let message = packet.take_json()?;
            self.0.borrow_mut().messages.push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_daemon_launches_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut hub = ConnectionManager::new("orchestrator", AuthPolicies::new(), SameHostPolicy::Never);
        hub.register_server_protocol(SLAVE_PROTOCOL, FLEET_VERSION, 0, FakeOrchestrator(seen.clone()));
        let addr = hub.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut config = ModnetConfig::default();
        config.module_name = "gpu1-daemon".to_string();
        config.wire.auth_file = Some(dir.path().join("authorization"));
        let daemon = SlaveDaemon::new(&config, addr, "gpu1", None).unwrap();

        let interval = Duration::from_millis(10);
        let drive = async {
            assert!(hub
                .wait_until(300, interval, || seen.borrow().messages.len() == 1)
                .await
                .unwrap());
            let link = seen.borrow().link.unwrap();
            hub.send_json(
                link,
                &SlaveMessage::StartModule {
                    index: 2,
                    program: "sh".into(),
                    args: vec!["-c".into(), "exit 4".into()],
                    control: "127.0.0.1:1:2:-".into(),
                },
            )
            .unwrap();
            assert!(hub
                .wait_until(300, interval, || seen.borrow().messages.len() == 3)
                .await
                .unwrap());
            hub.send_json(link, &SlaveMessage::Shutdown).unwrap();
            hub.poll_for(Duration::from_millis(50)).await.unwrap();
        };
        let (result, ()) = tokio::join!(daemon.run(), drive);
        result.unwrap();

        let seen = seen.borrow();
        assert_eq!(
            seen.messages[0],
            SlaveMessage::Register {
                alias: "gpu1".into()
            }
        );
        assert!(matches!(seen.messages[1], SlaveMessage::ModuleStarted { index: 2, .. }));
        assert_eq!(
            seen.messages[2],
            SlaveMessage::ModuleExited {
                index: 2,
                exit: crate::control::ExitReport::Exited(4)
            }
        );
    }

    #[tokio::test]
    async fn test_daemon_reports_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let seen = Rc::new(RefCell::new(Seen::default()));
        let mut hub = ConnectionManager::new("orchestrator", AuthPolicies::new(), SameHostPolicy::Never);
        hub.register_server_protocol(SLAVE_PROTOCOL, FLEET_VERSION, 0, FakeOrchestrator(seen.clone()));
        let addr = hub.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut config = ModnetConfig::default();
        config.wire.auth_file = Some(dir.path().join("authorization"));
        let daemon = SlaveDaemon::new(&config, addr, "gpu2", None).unwrap();

        let interval = Duration::from_millis(10);
        let drive = async {
            assert!(hub
                .wait_until(300, interval, || seen.borrow().link.is_some())
                .await
                .unwrap());
            let link = seen.borrow().link.unwrap();
            hub.send_json(
                link,
                &SlaveMessage::StartModule {
                    index: 0,
                    program: dir.path().join("no-such-program").display().to_string(),
                    args: Vec::new(),
                    control: "127.0.0.1:1:0:-".into(),
                },
            )
            .unwrap();
            assert!(hub
                .wait_until(300, interval, || seen.borrow().messages.len() == 2)
                .await
                .unwrap());
            // Dropping the orchestrator ends the daemon too.
            drop(hub);
        };
        let (result, ()) = tokio::join!(daemon.run(), drive);
        result.unwrap();
        assert!(matches!(
            seen.borrow().messages[1],
            SlaveMessage::ModuleFailed { index: 0, .. }
        ));
    }
}
