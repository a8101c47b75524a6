//! Token-passing replication of one overlay list.
//!
//! One master and any number of slaves form a star; slaves only talk to the
//! master. A single token grants the right to originate mutations. The list
//! is sans-IO: every operation returns the instructions to send, addressed
//! to peer handles of type `P`, and the caller delivers them in order.
//!
//! Transitions are driven only by `RequestToken`, `GrantToken` and
//! connection loss; there are no timers.

use crate::error::{OverlayError, OverlayResult};
use crate::object::{Instruction, Mutation, ObjectKey, OverlayObject, OverlaySpec};
use std::collections::VecDeque;
use std::fmt::Debug;
use tracing::{debug, info};

/// List id of every master.
pub const MASTER_LIST_ID: u32 = 1;

/// A slave that has not been assigned a list id yet.
pub const UNASSIGNED_LIST_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

/// Exactly one of these holds for every list at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Held,
    Requested,
    Idle,
}

/// One instruction addressed to one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound<P> {
    pub to: P,
    pub instruction: Instruction,
}

/// What render targets need to do after the list changed.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderEvent {
    /// One object was appended.
    Draw(OverlayObject),
    /// Objects were removed or moved; repaint the whole list.
    Redraw,
}

/// A replicated, ordered list of overlay objects.
#[derive(Debug)]
pub struct OverlayList<P> {
    role: Role,
    list_id: u32,
    spec: OverlaySpec,
    objects: Vec<OverlayObject>,
    pending: VecDeque<Instruction>,
    have_token: bool,
    token_requested: bool,
    next_object_id: u32,
    // Master only.
    slaves: Vec<P>,
    requests: VecDeque<P>,
    holder: Option<P>,
    next_slave_id: u32,
    // Slave only.
    master: Option<P>,
    render: Vec<RenderEvent>,
}

impl<P: Copy + Eq + Debug> OverlayList<P> {
    /// A master list. It starts out holding the token.
    pub fn master(spec: OverlaySpec) -> Self {
        Self::new(Role::Master, MASTER_LIST_ID, spec, true)
    }

    /// A slave list waiting for its master.
    pub fn slave() -> Self {
        Self::new(Role::Slave, UNASSIGNED_LIST_ID, OverlaySpec::default(), false)
    }

    fn new(role: Role, list_id: u32, spec: OverlaySpec, have_token: bool) -> Self {
        Self {
            role,
            list_id,
            spec,
            objects: Vec::new(),
            pending: VecDeque::new(),
            have_token,
            token_requested: false,
            next_object_id: 1,
            slaves: Vec::new(),
            requests: VecDeque::new(),
            holder: None,
            next_slave_id: MASTER_LIST_ID + 1,
            master: None,
            render: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// This instance's list id, or [`UNASSIGNED_LIST_ID`].
    pub fn list_id(&self) -> u32 {
        self.list_id
    }

    pub fn spec(&self) -> &OverlaySpec {
        &self.spec
    }

    pub fn objects(&self) -> &[OverlayObject] {
        &self.objects
    }

    pub fn has_token(&self) -> bool {
        self.have_token
    }

    pub fn token_state(&self) -> TokenState {
        if self.have_token {
            TokenState::Held
        } else if self.token_requested {
            TokenState::Requested
        } else {
            TokenState::Idle
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Slave whose connection currently holds the master's token.
    pub fn holder(&self) -> Option<P> {
        self.holder
    }

    pub fn slaves(&self) -> &[P] {
        &self.slaves
    }

    /// The master a slave is bound to.
    pub fn master_peer(&self) -> Option<P> {
        self.master
    }

    /// Render work accumulated since the last call.
    pub fn take_render_events(&mut self) -> Vec<RenderEvent> {
        std::mem::take(&mut self.render)
    }

    /// Add a slave to the fan-out set and bring it up to date.
    pub fn attach_slave(&mut self, peer: P) -> OverlayResult<Vec<Outbound<P>>> {
        self.require(Role::Master, "AttachSlave")?;
        let list_id = self.next_slave_id;
        self.next_slave_id += 1;
        self.slaves.push(peer);
        info!(?peer, list_id, objects = self.objects.len(), "Slave attached");

        let mut out = vec![Outbound {
            to: peer,
            instruction: Instruction::AssignListId {
                list_id,
                spec: self.spec.clone(),
            },
        }];
        out.extend(self.objects.iter().map(|obj| Outbound {
            to: peer,
            instruction: Instruction::Draw(obj.clone()),
        }));
        Ok(out)
    }

    /// Bind a slave to its master. The slave gives up any token it held
    /// while standalone.
    pub fn attach_master(&mut self, peer: P) -> OverlayResult<Vec<Outbound<P>>> {
        self.require(Role::Slave, "AttachMaster")?;
        self.master = Some(peer);
        self.have_token = false;
        self.token_requested = false;
        let mut out = Vec::new();
        if !self.pending.is_empty() {
            self.request(&mut out);
        }
        Ok(out)
    }

    /// Originate a mutation. Returns the new object's key for draws.
    ///
    /// Without the token the mutation is queued and one `RequestToken` goes
    /// toward the last known holder.
    pub fn submit(&mut self, mutation: Mutation) -> (Option<ObjectKey>, Vec<Outbound<P>>) {
        let (instruction, key) = match mutation {
            Mutation::Draw { colour, shape } => {
                let key = ObjectKey {
                    list_id: self.list_id,
                    object_id: self.next_object_id,
                };
                self.next_object_id += 1;
                (Instruction::Draw(OverlayObject { key, colour, shape }), Some(key))
            }
            Mutation::RemoveObjects { count } => (Instruction::RemoveObjects { count }, None),
            Mutation::RemoveObject { key } => (Instruction::RemoveObject { key }, None),
            Mutation::MoveObject { key, system, dx, dy } => {
                (Instruction::MoveObject { key, system, dx, dy }, None)
            }
        };

        let mut out = Vec::new();
        if self.have_token {
            self.originate(instruction, &mut out);
        } else {
            self.pending.push_back(instruction);
            if !self.token_requested {
                self.request(&mut out);
            }
        }
        (key, out)
    }

    /// Handle one instruction from `from`.
    pub fn receive(&mut self, from: P, instruction: Instruction) -> OverlayResult<Vec<Outbound<P>>> {
        let mut out = Vec::new();
        match instruction {
            Instruction::RequestToken => self.on_request(from, &mut out),
            Instruction::GrantToken => {
                if !self.token_requested {
                    return Err(OverlayError::UnexpectedGrant {
                        from: format!("{from:?}"),
                    });
                }
                debug!(role = self.role.name(), ?from, "Token granted");
                self.take_token(&mut out);
            }
            Instruction::AssignListId { list_id, spec } => {
                self.require(Role::Slave, "AssignListId")?;
                debug!(list_id, "List id assigned");
                self.list_id = list_id;
                self.spec = spec;
                for obj in self.objects.iter_mut().filter(|o| o.key.list_id == UNASSIGNED_LIST_ID) {
                    obj.key.list_id = list_id;
                }
            }
            data => {
                if self.role == Role::Master {
                    self.fan_out(&data, Some(from), &mut out);
                }
                self.apply(data);
            }
        }
        Ok(out)
    }

    /// Handle the loss of a peer connection.
    pub fn connection_lost(&mut self, peer: P) -> Vec<Outbound<P>> {
        let mut out = Vec::new();
        match self.role {
            Role::Master => {
                self.slaves.retain(|p| *p != peer);
                self.requests.retain(|p| *p != peer);
                if self.holder == Some(peer) {
                    info!(?peer, "Token holder disconnected, reclaiming token");
                    self.take_token(&mut out);
                }
            }
            Role::Slave => {
                if self.master == Some(peer) {
                    info!(?peer, "Master disconnected, continuing standalone");
                    self.master = None;
                    self.take_token(&mut out);
                }
            }
        }
        out
    }

    fn require(&self, role: Role, instruction: &'static str) -> OverlayResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(OverlayError::WrongRole {
                instruction,
                role: self.role.name(),
            })
        }
    }

    /// Ask the last known holder for the token.
    fn request(&mut self, out: &mut Vec<Outbound<P>>) {
        let target = match self.role {
            Role::Master => self.holder,
            Role::Slave => self.master,
        };
        if let Some(to) = target {
            self.token_requested = true;
            out.push(Outbound {
                to,
                instruction: Instruction::RequestToken,
            });
        }
    }

    fn on_request(&mut self, from: P, out: &mut Vec<Outbound<P>>) {
        match self.role {
            Role::Master if self.have_token => self.grant(from, out),
            Role::Master => {
                if !self.requests.contains(&from) {
                    self.requests.push_back(from);
                }
                if !self.token_requested {
                    self.request(out);
                }
            }
            Role::Slave if self.have_token => {
                self.have_token = false;
                out.push(Outbound {
                    to: from,
                    instruction: Instruction::GrantToken,
                });
            }
            Role::Slave => debug!(?from, "Token request while not holding the token"),
        }
    }

    fn grant(&mut self, to: P, out: &mut Vec<Outbound<P>>) {
        self.have_token = false;
        self.holder = Some(to);
        out.push(Outbound {
            to,
            instruction: Instruction::GrantToken,
        });
    }

    /// The token arrived (or was reclaimed). Drain pending mutations, then a
    /// master passes the token to the oldest requester.
    fn take_token(&mut self, out: &mut Vec<Outbound<P>>) {
        self.have_token = true;
        self.token_requested = false;
        self.holder = None;
        while let Some(instruction) = self.pending.pop_front() {
            self.originate(instruction, out);
        }
        if self.role == Role::Master {
            if let Some(next) = self.requests.pop_front() {
                self.grant(next, out);
                if !self.requests.is_empty() {
                    self.request(out);
                }
            }
        }
    }

    /// Apply a mutation originated here while holding the token.
    fn originate(&mut self, mut instruction: Instruction, out: &mut Vec<Outbound<P>>) {
        // Keys handed out before the list id was known name this list.
        let key = match &mut instruction {
            Instruction::Draw(obj) => Some(&mut obj.key),
            Instruction::RemoveObject { key } | Instruction::MoveObject { key, .. } => Some(key),
            _ => None,
        };
        if let Some(key) = key.filter(|k| k.list_id == UNASSIGNED_LIST_ID) {
            key.list_id = self.list_id;
        }
        match self.role {
            Role::Master => {
                self.apply(instruction.clone());
                self.fan_out(&instruction, None, out);
            }
            Role::Slave => {
                if let Some(master) = self.master {
                    out.push(Outbound {
                        to: master,
                        instruction: instruction.clone(),
                    });
                }
                self.apply(instruction);
            }
        }
    }

    fn fan_out(&self, instruction: &Instruction, except: Option<P>, out: &mut Vec<Outbound<P>>) {
        for slave in self.slaves.iter().filter(|s| Some(**s) != except) {
            out.push(Outbound {
                to: *slave,
                instruction: instruction.clone(),
            });
        }
    }

    fn position(&self, key: ObjectKey) -> Option<usize> {
        self.objects.iter().position(|o| o.key == key)
    }

    fn apply(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Draw(obj) => {
                self.render.push(RenderEvent::Draw(obj.clone()));
                self.objects.push(obj);
            }
            Instruction::RemoveObjects { count } => {
                let keep = match count as usize {
                    0 => 0,
                    n => self.objects.len().saturating_sub(n),
                };
                self.objects.truncate(keep);
                self.render.push(RenderEvent::Redraw);
            }
            Instruction::RemoveObject { key } => match self.position(key) {
                Some(pos) => {
                    self.objects.remove(pos);
                    self.render.push(RenderEvent::Redraw);
                }
                None => debug!(%key, "RemoveObject for unknown object"),
            },
            Instruction::MoveObject { key, system, dx, dy } => match self.position(key) {
                Some(pos) => {
                    self.objects[pos].translate(system, dx, dy);
                    self.render.push(RenderEvent::Redraw);
                }
                None => debug!(%key, "MoveObject for unknown object"),
            },
            Instruction::RequestToken | Instruction::GrantToken | Instruction::AssignListId { .. } => {
                unreachable!("control instruction applied as list data")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Coord, CoordSystem, Shape};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    const MASTER: usize = 0;

    fn line(colour: &str, x: f64) -> Mutation {
        Mutation::Draw {
            colour: colour.to_string(),
            shape: Shape::Line {
                from: Coord::world(x, 0.0),
                to: Coord::world(x + 1.0, 1.0),
            },
        }
    }

    /// A star of lists with one FIFO queue per directed link.
    struct Star {
        nodes: Vec<OverlayList<usize>>,
        links: HashMap<(usize, usize), VecDeque<Instruction>>,
        sent: Vec<(usize, usize, Instruction)>,
    }

    impl Star {
        fn new(slaves: usize) -> Self {
            let mut star = Star {
                nodes: vec![OverlayList::master(OverlaySpec::new("RA", "Dec"))],
                links: HashMap::new(),
                sent: Vec::new(),
            };
            for id in 1..=slaves {
                star.nodes.push(OverlayList::slave());
                let out = star.nodes[MASTER].attach_slave(id).unwrap();
                star.push(MASTER, out);
                let out = star.nodes[id].attach_master(MASTER).unwrap();
                star.push(id, out);
            }
            star.settle();
            star
        }

        fn push(&mut self, from: usize, out: Vec<Outbound<usize>>) {
            for o in out {
                self.sent.push((from, o.to, o.instruction.clone()));
                self.links.entry((from, o.to)).or_default().push_back(o.instruction);
            }
        }

        fn submit(&mut self, node: usize, mutation: Mutation) -> Option<ObjectKey> {
            let (key, out) = self.nodes[node].submit(mutation);
            self.push(node, out);
            key
        }

        fn deliver(&mut self, from: usize, to: usize) -> bool {
            let Some(instruction) = self.links.get_mut(&(from, to)).and_then(|q| q.pop_front()) else {
                return false;
            };
            let out = self.nodes[to].receive(from, instruction).unwrap();
            self.push(to, out);
            true
        }

        fn busy_links(&self) -> Vec<(usize, usize)> {
            let mut links: Vec<_> = self
                .links
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| *k)
                .collect();
            links.sort();
            links
        }

        fn settle(&mut self) {
            for _ in 0..100_000 {
                let busy = self.busy_links();
                let Some(&(from, to)) = busy.first() else {
                    return;
                };
                self.deliver(from, to);
            }
            panic!("star did not settle");
        }

        fn holders(&self) -> usize {
            self.nodes.iter().filter(|n| n.has_token()).count()
        }
    }

    #[test]
    fn test_master_starts_with_token() {
        let star = Star::new(2);
        assert_eq!(star.nodes[MASTER].token_state(), TokenState::Held);
        assert_eq!(star.nodes[1].token_state(), TokenState::Idle);
        assert_eq!(star.nodes[1].list_id(), 2);
        assert_eq!(star.nodes[2].list_id(), 3);
        assert_eq!(star.nodes[2].spec().x_label, "RA");
    }

    #[test]
    fn test_master_fans_out_directly() {
        let mut star = Star::new(2);
        let key = star.submit(MASTER, line("blue", 0.0)).unwrap();
        assert_eq!(key, ObjectKey { list_id: 1, object_id: 1 });
        assert_eq!(star.nodes[MASTER].objects().len(), 1);
        assert_eq!(star.busy_links(), vec![(0, 1), (0, 2)]);
        star.settle();
        assert_eq!(star.nodes[1].objects(), star.nodes[MASTER].objects());
        assert_eq!(star.nodes[2].objects(), star.nodes[MASTER].objects());
    }

    #[test]
    fn test_slave_line_scenario() {
        let mut star = Star::new(1);
        star.sent.clear();

        let key = star.submit(1, line("red", 0.0)).unwrap();
        // Buffered locally, exactly one request toward the master.
        assert!(star.nodes[1].objects().is_empty());
        assert_eq!(star.nodes[1].pending_len(), 1);
        assert_eq!(star.sent, vec![(1, 0, Instruction::RequestToken)]);

        assert!(star.deliver(1, 0));
        assert_eq!(star.busy_links(), vec![(0, 1)]);
        assert!(star.deliver(0, 1));
        // Forwarded to the master, then applied locally.
        assert_eq!(star.nodes[1].objects().len(), 1);
        assert!(matches!(star.sent.last(), Some((1, 0, Instruction::Draw(_)))));
        star.settle();

        let master = star.nodes[MASTER].objects();
        assert_eq!(master, star.nodes[1].objects());
        assert_eq!(master.len(), 1);
        assert_eq!(master[0].colour, "red");
        assert_eq!(master[0].key, key);
        assert_eq!(key, ObjectKey { list_id: 2, object_id: 1 });
        assert_eq!(
            star.sent
                .iter()
                .filter(|(_, _, i)| *i == Instruction::RequestToken)
                .count(),
            1
        );
    }

    #[test]
    fn test_requests_served_in_order() {
        let mut star = Star::new(3);
        // Slave 1 takes the token.
        star.submit(1, line("a", 0.0));
        star.settle();
        assert!(star.nodes[1].has_token());

        // Slaves 3 and 2 queue up behind it.
        star.submit(3, line("c", 0.0));
        star.deliver(3, 0);
        star.submit(2, line("b", 0.0));
        star.deliver(2, 0);
        assert_eq!(star.nodes[MASTER].token_state(), TokenState::Requested);

        star.settle();
        let colours: Vec<_> = star.nodes[MASTER]
            .objects()
            .iter()
            .map(|o| o.colour.as_str())
            .collect();
        assert_eq!(colours, vec!["a", "c", "b"]);
        assert!(star.nodes[2].has_token());
        assert_eq!(star.holders(), 1);
    }

    #[test]
    fn test_lost_holder_is_implicit_grant() {
        let mut star = Star::new(2);
        star.submit(1, line("a", 0.0));
        star.settle();
        assert_eq!(star.nodes[MASTER].holder(), Some(1));

        // Master and slave 2 both want the token; slave 1 vanishes.
        star.submit(MASTER, line("m", 0.0));
        star.submit(2, line("b", 0.0));
        star.deliver(2, 0);
        star.links.remove(&(0, 1));
        let out = star.nodes[MASTER].connection_lost(1);
        star.push(MASTER, out);

        assert_eq!(star.nodes[MASTER].slaves(), &[2]);
        star.settle();
        let colours: Vec<_> = star.nodes[MASTER]
            .objects()
            .iter()
            .map(|o| o.colour.as_str())
            .collect();
        assert_eq!(colours, vec!["a", "m", "b"]);
        assert_eq!(star.nodes[2].objects(), star.nodes[MASTER].objects());
        assert!(star.nodes[2].has_token());
    }

    #[test]
    fn test_lost_requester_is_purged() {
        let mut star = Star::new(3);
        star.submit(1, line("a", 0.0));
        star.settle();
        star.submit(2, line("b", 0.0));
        star.deliver(2, 0);
        star.submit(3, line("c", 0.0));
        star.deliver(3, 0);

        star.links.remove(&(0, 2));
        let out = star.nodes[MASTER].connection_lost(2);
        star.push(MASTER, out);
        star.settle();

        assert!(star.nodes[3].has_token());
        assert_eq!(star.nodes[MASTER].objects().len(), 2);
        assert_eq!(star.nodes[3].objects(), star.nodes[MASTER].objects());
    }

    #[test]
    fn test_slave_continues_standalone() {
        let mut star = Star::new(1);
        star.submit(1, line("queued", 0.0));
        star.links.clear();
        let out = star.nodes[1].connection_lost(MASTER);
        assert!(out.is_empty());
        assert!(star.nodes[1].has_token());
        assert_eq!(star.nodes[1].objects().len(), 1);

        star.submit(1, line("later", 1.0));
        assert_eq!(star.nodes[1].objects().len(), 2);
        assert!(star.busy_links().is_empty());
    }

    #[test]
    fn test_unexpected_grant_is_error() {
        let mut slave: OverlayList<usize> = OverlayList::slave();
        slave.attach_master(MASTER).unwrap();
        let err = slave.receive(MASTER, Instruction::GrantToken).unwrap_err();
        assert!(matches!(err, OverlayError::UnexpectedGrant { .. }));
    }

    #[test]
    fn test_wrong_role_rejected() {
        let mut master: OverlayList<usize> = OverlayList::master(OverlaySpec::default());
        assert!(master.attach_master(3).is_err());
        let err = master
            .receive(
                3,
                Instruction::AssignListId {
                    list_id: 4,
                    spec: OverlaySpec::default(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, OverlayError::WrongRole { role: "master", .. }));
    }

    #[test]
    fn test_remove_and_move_by_key() {
        let mut star = Star::new(1);
        let mut keys = Vec::new();
        for i in 0..5 {
            keys.push(star.submit(MASTER, line("m", i as f64)).unwrap());
            keys.push(star.submit(1, line("s", i as f64)).unwrap());
            star.settle();
        }
        star.submit(1, Mutation::RemoveObject { key: keys[3] });
        star.submit(
            MASTER,
            Mutation::MoveObject {
                key: keys[4],
                system: CoordSystem::World,
                dx: 10.0,
                dy: 0.0,
            },
        );
        star.settle();

        let objects = star.nodes[MASTER].objects();
        assert_eq!(objects.len(), 9);
        assert!(objects.iter().all(|o| o.key != keys[3]));
        for obj in objects {
            let Shape::Line { from, .. } = &obj.shape else {
                panic!("Expected line");
            };
            // Master and slave drew one line each at x = round.
            let round = keys.iter().position(|k| *k == obj.key).unwrap() / 2;
            let expected = if obj.key == keys[4] { 12.0 } else { round as f64 };
            assert_eq!(from.x, expected, "object {}", obj.key);
        }
        assert_eq!(star.nodes[1].objects(), objects);
    }

    #[test]
    fn test_key_from_before_attach_addresses_object() {
        let mut star = Star::new(0);
        star.nodes.push(OverlayList::slave());
        let key = star.submit(1, line("early", 0.0)).unwrap();
        assert_eq!(key.list_id, UNASSIGNED_LIST_ID);

        let out = star.nodes[MASTER].attach_slave(1).unwrap();
        star.push(MASTER, out);
        let out = star.nodes[1].attach_master(MASTER).unwrap();
        star.push(1, out);
        star.settle();
        assert_eq!(star.nodes[MASTER].objects().len(), 1);
        assert_eq!(
            star.nodes[1].objects()[0].key,
            ObjectKey {
                list_id: 2,
                object_id: key.object_id
            }
        );

        star.submit(
            1,
            Mutation::MoveObject {
                key,
                system: CoordSystem::World,
                dx: 5.0,
                dy: 0.0,
            },
        );
        star.settle();
        let Shape::Line { from, .. } = &star.nodes[MASTER].objects()[0].shape else {
            panic!("Expected line");
        };
        assert_eq!(from.x, 5.0);

        star.submit(1, Mutation::RemoveObject { key });
        star.settle();
        assert!(star.nodes[1].objects().is_empty());
        assert!(star.nodes[MASTER].objects().is_empty());
    }

    #[test]
    fn test_remove_objects_counts() {
        let mut star = Star::new(1);
        for i in 0..4 {
            star.submit(MASTER, line("m", i as f64));
        }
        star.submit(1, Mutation::RemoveObjects { count: 3 });
        star.settle();
        assert_eq!(star.nodes[1].objects().len(), 1);
        star.submit(MASTER, Mutation::RemoveObjects { count: 0 });
        star.settle();
        assert!(star.nodes[1].objects().is_empty());
        assert!(star.nodes[MASTER].objects().is_empty());
    }

    #[test]
    fn test_late_slave_gets_snapshot() {
        let mut star = Star::new(1);
        star.submit(1, line("early", 0.0));
        star.settle();

        star.nodes.push(OverlayList::slave());
        let out = star.nodes[MASTER].attach_slave(2).unwrap();
        star.push(MASTER, out);
        let out = star.nodes[2].attach_master(MASTER).unwrap();
        star.push(2, out);
        star.submit(2, line("late", 1.0));
        star.settle();

        assert_eq!(star.nodes[2].objects().len(), 2);
        assert_eq!(star.nodes[2].objects(), star.nodes[MASTER].objects());
        assert_eq!(star.nodes[1].objects(), star.nodes[MASTER].objects());
    }

    #[test]
    fn test_random_interleavings_converge() {
        for seed in 0..40u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let slaves = rng.gen_range(1..5);
            let mut star = Star::new(slaves);

            for step in 0..400 {
                let busy = star.busy_links();
                if busy.is_empty() || rng.gen_bool(0.35) {
                    let node = rng.gen_range(0..=slaves);
                    let existing: Vec<ObjectKey> =
                        star.nodes[node].objects().iter().map(|o| o.key).collect();
                    let mutation = match rng.gen_range(0..10) {
                        0 if !existing.is_empty() => Mutation::RemoveObject {
                            key: existing[rng.gen_range(0..existing.len())],
                        },
                        1 if !existing.is_empty() => Mutation::MoveObject {
                            key: existing[rng.gen_range(0..existing.len())],
                            system: CoordSystem::World,
                            dx: 1.0,
                            dy: -1.0,
                        },
                        2 => Mutation::RemoveObjects { count: 1 },
                        _ => line(&format!("n{node}s{step}"), step as f64),
                    };
                    star.submit(node, mutation);
                } else {
                    let (from, to) = busy[rng.gen_range(0..busy.len())];
                    star.deliver(from, to);
                }
                assert!(star.holders() <= 1, "seed {seed} step {step}");
            }

            star.settle();
            assert_eq!(star.holders(), 1, "seed {seed}");
            let master = star.nodes[MASTER].objects().to_vec();
            for (id, node) in star.nodes.iter().enumerate() {
                assert_eq!(node.pending_len(), 0, "seed {seed} node {id}");
                assert_eq!(node.objects(), master.as_slice(), "seed {seed} node {id}");
            }
        }
    }
}
