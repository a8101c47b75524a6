//! The overlay protocol: an [`OverlayList`] wired to the connection manager.
//!
//! A master registers [`Overlay::handler`] as a server protocol and every
//! accepted connection becomes a slave. A slave registers it as a client
//! protocol and connects to its master once.

use crate::error::OverlayError;
use crate::list::{Outbound, OverlayList, Role};
use crate::object::{Coord, CoordSystem, Mutation, ObjectKey, OverlayObject, OverlaySpec, Shape};
use crate::packet::InstructionPacket;
use crate::render::{RenderTargets, Renderer};
use modnet_wire::{ConnectionId, Context, PacketReader, ProtocolHandler, WireError, WireResult};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{trace, warn};

pub const OVERLAY_PROTOCOL: &str = "overlay";
pub const OVERLAY_VERSION: u32 = 1;

struct OverlayNode {
    list: OverlayList<ConnectionId>,
    targets: RenderTargets,
}

impl OverlayNode {
    fn render(&mut self) {
        let events = self.list.take_render_events();
        self.targets.render(self.list.spec(), self.list.objects(), events);
    }
}

/// Application handle on one replicated overlay list.
#[derive(Clone)]
pub struct Overlay {
    node: Rc<RefCell<OverlayNode>>,
}

impl Overlay {
    pub fn master(spec: OverlaySpec) -> Self {
        Self::with_list(OverlayList::master(spec))
    }

    pub fn slave() -> Self {
        Self::with_list(OverlayList::slave())
    }

    fn with_list(list: OverlayList<ConnectionId>) -> Self {
        Self {
            node: Rc::new(RefCell::new(OverlayNode {
                list,
                targets: RenderTargets::new(),
            })),
        }
    }

    /// Protocol handler to register with the connection manager.
    pub fn handler(&self) -> OverlayProtocol {
        OverlayProtocol {
            node: self.node.clone(),
        }
    }

    /// Draw objects on `renderer` when its spec matches the list's.
    pub fn attach_renderer(&self, spec: OverlaySpec, renderer: impl Renderer + 'static) {
        self.node.borrow_mut().targets.attach(spec, renderer);
    }

    pub fn role(&self) -> Role {
        self.node.borrow().list.role()
    }

    pub fn list_id(&self) -> u32 {
        self.node.borrow().list.list_id()
    }

    pub fn has_token(&self) -> bool {
        self.node.borrow().list.has_token()
    }

    pub fn objects(&self) -> Vec<OverlayObject> {
        self.node.borrow().list.objects().to_vec()
    }

    /// Originate a mutation, sending whatever the token protocol requires.
    pub fn submit(&self, cx: &mut Context<'_>, mutation: Mutation) -> Option<ObjectKey> {
        let mut node = self.node.borrow_mut();
        let (key, out) = node.list.submit(mutation);
        deliver(cx, out);
        node.render();
        key
    }

    pub fn line(&self, cx: &mut Context<'_>, from: Coord, to: Coord, colour: &str) -> ObjectKey {
        self.draw(cx, colour, Shape::Line { from, to })
    }

    pub fn text(&self, cx: &mut Context<'_>, at: Coord, text: &str, font: &str, colour: &str) -> ObjectKey {
        self.draw(
            cx,
            colour,
            Shape::Text {
                at,
                text: text.to_string(),
                font: font.to_string(),
            },
        )
    }

    pub fn draw(&self, cx: &mut Context<'_>, colour: &str, shape: Shape) -> ObjectKey {
        let mutation = Mutation::Draw {
            colour: colour.to_string(),
            shape,
        };
        match self.submit(cx, mutation) {
            Some(key) => key,
            None => unreachable!("draw mutations always produce a key"),
        }
    }

    pub fn remove_object(&self, cx: &mut Context<'_>, key: ObjectKey) {
        self.submit(cx, Mutation::RemoveObject { key });
    }

    pub fn move_object(&self, cx: &mut Context<'_>, key: ObjectKey, system: CoordSystem, dx: f64, dy: f64) {
        self.submit(cx, Mutation::MoveObject { key, system, dx, dy });
    }

    /// Remove every object.
    pub fn clear(&self, cx: &mut Context<'_>) {
        self.submit(cx, Mutation::RemoveObjects { count: 0 });
    }
}

/// Send each instruction to its peer. A peer that has gone away is skipped;
/// its close event takes care of the list.
fn deliver(cx: &mut Context<'_>, out: Vec<Outbound<ConnectionId>>) {
    for Outbound { to, instruction } in out {
        trace!(conn = %to, ?instruction, "Overlay send");
        if let Err(e) = cx.send_json(to, &InstructionPacket::from(&instruction)) {
            warn!(conn = %to, error = %e, "Failed to send overlay instruction");
        }
    }
}

/// [`ProtocolHandler`] side of an [`Overlay`].
pub struct OverlayProtocol {
    node: Rc<RefCell<OverlayNode>>,
}

impl ProtocolHandler for OverlayProtocol {
    fn on_open(&mut self, cx: &mut Context<'_>, conn: ConnectionId) -> WireResult<()> {
        let mut node = self.node.borrow_mut();
        let out = match node.list.role() {
            Role::Master => node.list.attach_slave(conn)?,
            Role::Slave => {
                if let Some(master) = node.list.master_peer() {
                    return Err(WireError::Handler(format!(
                        "overlay slave already attached to {master}"
                    )));
                }
                node.list.attach_master(conn)?
            }
        };
        deliver(cx, out);
        Ok(())
    }

    fn on_read(&mut self, cx: &mut Context<'_>, conn: ConnectionId, packet: &mut PacketReader) -> WireResult<()> {
        let packet: InstructionPacket = packet.take_json()?;
        let instruction = crate::object::Instruction::try_from(packet)?;
        trace!(%conn, ?instruction, "Overlay receive");

        let mut node = self.node.borrow_mut();
        let out = match node.list.receive(conn, instruction) {
            Ok(out) => out,
            Err(e @ OverlayError::UnexpectedGrant { .. }) => panic!("overlay token protocol broken: {e}"),
            Err(e) => return Err(e.into()),
        };
        deliver(cx, out);
        node.render();
        Ok(())
    }

    fn on_close(&mut self, cx: &mut Context<'_>, conn: ConnectionId) {
        let mut node = self.node.borrow_mut();
        let out = node.list.connection_lost(conn);
        deliver(cx, out);
        node.render();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modnet_types::SameHostPolicy;
    use modnet_wire::{AuthPolicies, ConnectionManager};
    use std::time::Duration;

    async fn pump<F: FnMut() -> bool>(managers: &mut [&mut ConnectionManager], mut done: F) {
        for _ in 0..500 {
            if done() {
                return;
            }
            for m in managers.iter_mut() {
                m.poll(Duration::from_millis(5)).await.unwrap();
            }
        }
        panic!("condition not reached");
    }

    struct Count(Rc<RefCell<usize>>);

    impl Renderer for Count {
        fn draw(&mut self, _object: &OverlayObject) {
            *self.0.borrow_mut() += 1;
        }

        fn redraw(&mut self, objects: &[OverlayObject]) {
            *self.0.borrow_mut() = objects.len();
        }
    }

    #[tokio::test]
    async fn test_replicates_over_loopback() {
        let spec = OverlaySpec::new("RA", "Dec");
        let master = Overlay::master(spec.clone());
        let mut hub = ConnectionManager::new("viewer", AuthPolicies::new(), SameHostPolicy::Never);
        hub.register_server_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 0, master.handler());
        let addr = hub.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let drawn = Rc::new(RefCell::new(0));
        let slaves: Vec<Overlay> = (0..2).map(|_| Overlay::slave()).collect();
        slaves[1].attach_renderer(spec.clone(), Count(drawn.clone()));
        let mut peers = Vec::new();
        for (i, slave) in slaves.iter().enumerate() {
            let mut m = ConnectionManager::new(format!("tool{i}"), AuthPolicies::new(), SameHostPolicy::Never);
            m.register_client_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 1, slave.handler());
            m.connect(addr, OVERLAY_PROTOCOL).await.unwrap();
            peers.push(m);
        }
        let (first, rest) = peers.split_at_mut(1);
        let (a, b) = (&mut first[0], &mut rest[0]);

        pump(&mut [&mut hub, &mut *a, &mut *b], || {
            slaves.iter().all(|s| s.list_id() > 1)
        })
        .await;

        // First slave lacks the token and must borrow it from the master.
        let key = slaves[0].line(
            &mut a.context(),
            Coord::world(0.0, 0.0),
            Coord::world(1.0, 1.0),
            "red",
        );
        assert!(slaves[0].objects().is_empty());
        pump(&mut [&mut hub, &mut *a, &mut *b], || slaves[1].objects().len() == 1).await;

        let on_master = master.objects();
        assert_eq!(on_master.len(), 1);
        assert_eq!(on_master[0].key, key);
        assert_eq!(on_master[0].colour, "red");
        assert_eq!(slaves[0].objects(), on_master);
        assert_eq!(slaves[1].objects(), on_master);
        assert_eq!(*drawn.borrow(), 1);

        // The second slave removes it.
        slaves[1].remove_object(&mut b.context(), key);
        pump(&mut [&mut hub, &mut *a, &mut *b], || {
            master.objects().is_empty() && slaves[0].objects().is_empty()
        })
        .await;
        assert_eq!(*drawn.borrow(), 0);
    }

    #[tokio::test]
    async fn test_slave_survives_master_loss() {
        let master = Overlay::master(OverlaySpec::default());
        let mut hub = ConnectionManager::new("viewer", AuthPolicies::new(), SameHostPolicy::Never);
        hub.register_server_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 0, master.handler());
        let addr = hub.serve("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let slave = Overlay::slave();
        let mut tool = ConnectionManager::new("tool", AuthPolicies::new(), SameHostPolicy::Never);
        tool.register_client_protocol(OVERLAY_PROTOCOL, OVERLAY_VERSION, 1, slave.handler());
        tool.connect(addr, OVERLAY_PROTOCOL).await.unwrap();
        pump(&mut [&mut hub, &mut tool], || slave.list_id() == 2).await;

        drop(hub);
        pump(&mut [&mut tool], || slave.has_token()).await;
        slave.line(&mut tool.context(), Coord::pixel(1.0, 1.0), Coord::pixel(2.0, 2.0), "blue");
        assert_eq!(slave.objects().len(), 1);
        assert_eq!(slave.role(), Role::Slave);
    }
}
