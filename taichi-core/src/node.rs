//! Membership protocol engine. Host-driven: the host feeds beacons, inbound
//! mailbox payloads, local commands and ticks; the engine sends through the
//! [`Connector`] it owns and returns notifications for the application.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::codec::{DecodeError, Headers};
use crate::election::{Election, ElectionStep};
use crate::endpoint::file_service_endpoint;
use crate::identity::PeerId;
use crate::peer::{Connector, PeerRegistry};
use crate::group::GroupRegistry;
use crate::zre::ZreMessage;

/// SHOUT payload announcing that the sender serves files.
pub const FILE_SERVICE_MARKER: &[u8] = b"FMQSERVER";

pub const DEFAULT_EVASIVE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EXPIRED_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    /// Our mailbox endpoint as advertised in HELLO.
    pub endpoint: String,
    pub headers: Headers,
    pub evasive_timeout: Duration,
    pub expired_timeout: Duration,
    /// Port of the file service on a publishing peer's host.
    pub file_service_port: u16,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        NodeConfig {
            name: name.into(),
            endpoint: endpoint.into(),
            headers: Headers::new(),
            evasive_timeout: DEFAULT_EVASIVE_TIMEOUT,
            expired_timeout: DEFAULT_EXPIRED_TIMEOUT,
            file_service_port: 5670,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Enter {
        peer: PeerId,
        name: String,
        endpoint: String,
        headers: Headers,
    },
    Exit {
        peer: PeerId,
        name: String,
    },
    Join {
        peer: PeerId,
        name: String,
        group: String,
    },
    Leave {
        peer: PeerId,
        name: String,
        group: String,
    },
    Whisper {
        peer: PeerId,
        name: String,
        content: Vec<u8>,
    },
    Shout {
        peer: PeerId,
        name: String,
        group: String,
        content: Vec<u8>,
    },
    Evasive {
        peer: PeerId,
        name: String,
    },
    Leader {
        group: String,
        leader: PeerId,
    },
    FileService {
        peer: PeerId,
        name: String,
        endpoint: String,
    },
}

pub struct MembershipEngine<C: Connector> {
    id: PeerId,
    config: NodeConfig,
    connector: C,
    peers: PeerRegistry,
    groups: GroupRegistry,
    own_groups: BTreeSet<String>,
    /// Peers for which ENTER has been emitted.
    entered: HashSet<PeerId>,
    status: u8,
}

impl<C: Connector> MembershipEngine<C> {
    pub fn new(id: PeerId, config: NodeConfig, connector: C) -> Self {
        MembershipEngine {
            id,
            config,
            connector,
            peers: PeerRegistry::new(),
            groups: GroupRegistry::new(),
            own_groups: BTreeSet::new(),
            entered: HashSet::new(),
            status: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    // ----- discovery -----

    /// A beacon from `peer` advertising its mailbox at `endpoint`.
    pub fn on_beacon(&mut self, peer: PeerId, endpoint: &str, now: Instant) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if peer == self.id {
            return events;
        }
        if self.require_peer(peer, endpoint, now, &mut events) {
            if let Some(p) = self.peers.find_mut(&peer) {
                p.refresh(now, self.config.evasive_timeout, self.config.expired_timeout);
            }
        }
        events
    }

    pub fn on_beacon_departed(&mut self, peer: PeerId) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        self.remove_peer(&peer, &mut events);
        events
    }

    // ----- inbound -----

    /// One mailbox payload from `from`. Malformed input is returned as an
    /// error for the host to log; engine state is untouched.
    pub fn on_message(
        &mut self,
        from: PeerId,
        payload: &[u8],
        now: Instant,
    ) -> Result<Vec<NodeEvent>, DecodeError> {
        let msg = ZreMessage::decode(payload)?;
        let mut events = Vec::new();
        if from == self.id {
            return Ok(events);
        }
        trace!(peer = %from.short(), command = msg.command(), "recv");

        if let ZreMessage::Hello { endpoint, .. } = &msg {
            if self.peers.find(&from).is_some_and(|p| p.ready) {
                debug!(peer = %from.short(), "HELLO from ready peer, replacing");
                self.remove_peer(&from, &mut events);
            }
            if !self.require_peer(from, endpoint, now, &mut events) {
                return Ok(events);
            }
            if let Some(p) = self.peers.find_mut(&from) {
                p.ready = true;
            }
        }

        let Some(peer) = self.peers.find_mut(&from) else {
            debug!(peer = %from.short(), command = msg.command(), "message from unknown peer dropped");
            return Ok(events);
        };
        if !peer.ready {
            debug!(peer = %from.short(), command = msg.command(), "peer not ready, dropped");
            return Ok(events);
        }
        if peer.messages_lost(&msg) {
            self.remove_peer(&from, &mut events);
            return Ok(events);
        }

        match msg {
            ZreMessage::Hello {
                groups,
                status,
                name,
                headers,
                endpoint,
                ..
            } => {
                peer.name = name.clone();
                peer.headers = headers.clone();
                self.entered.insert(from);
                info!(peer = %from.short(), %name, %endpoint, "peer entered");
                events.push(NodeEvent::Enter {
                    peer: from,
                    name: name.clone(),
                    endpoint,
                    headers,
                });
                for group in groups {
                    self.join_peer_group(from, &group, &mut events);
                }
                if let Some(peer) = self.peers.find_mut(&from) {
                    peer.status = status;
                }
            }
            ZreMessage::Whisper { content, .. } => {
                events.push(NodeEvent::Whisper {
                    peer: from,
                    name: peer.name.clone(),
                    content,
                });
            }
            ZreMessage::Shout { group, content, .. } => {
                let name = peer.name.clone();
                let endpoint = peer.endpoint().map(str::to_owned);
                self.on_shout(from, name, endpoint, group, content, &mut events);
            }
            ZreMessage::Join { group, status, .. } => {
                if self.join_peer_group(from, &group, &mut events) {
                    self.check_status(from, status, &mut events);
                }
            }
            ZreMessage::Leave { group, status, .. } => {
                if self.leave_peer_group(from, &group, &mut events) {
                    self.check_status(from, status, &mut events);
                }
            }
            ZreMessage::Ping { .. } => {
                self.send_to(&from, ZreMessage::PingOk { sequence: 0 }, &mut events);
            }
            ZreMessage::PingOk { .. } => {}
            ZreMessage::Elect {
                group,
                round,
                challenger,
                ..
            } => self.on_elect(from, &group, round, challenger, &mut events),
            ZreMessage::Leader {
                group,
                round,
                leader,
                ..
            } => self.on_leader(from, &group, round, leader, &mut events),
            ZreMessage::Goodbye => {
                debug!(peer = %from.short(), "GOODBYE");
                self.remove_peer(&from, &mut events);
                return Ok(events);
            }
        }

        if let Some(peer) = self.peers.find_mut(&from) {
            peer.refresh(now, self.config.evasive_timeout, self.config.expired_timeout);
        }
        Ok(events)
    }

    fn on_shout(
        &mut self,
        from: PeerId,
        name: String,
        endpoint: Option<String>,
        group: String,
        content: Vec<u8>,
        events: &mut Vec<NodeEvent>,
    ) {
        if !self.own_groups.contains(&group) {
            trace!(peer = %from.short(), %group, "SHOUT to a group we are not in");
            return;
        }
        if content != FILE_SERVICE_MARKER {
            events.push(NodeEvent::Shout {
                peer: from,
                name,
                group,
                content,
            });
            return;
        }
        let Some(endpoint) = endpoint else { return };
        match file_service_endpoint(&endpoint, self.config.file_service_port) {
            Ok(endpoint) => {
                info!(peer = %from.short(), %endpoint, "file service announced");
                events.push(NodeEvent::FileService {
                    peer: from,
                    name,
                    endpoint,
                });
            }
            Err(e) => warn!(peer = %from.short(), error = %e, "bad file service endpoint"),
        }
    }

    /// JOIN/LEAVE carry the sender's status after the change; any other value
    /// means we missed a change.
    fn check_status(&mut self, from: PeerId, status: u8, events: &mut Vec<NodeEvent>) {
        let Some(peer) = self.peers.find(&from) else { return };
        if peer.status != status {
            warn!(
                peer = %from.short(),
                expected = peer.status,
                received = status,
                "status mismatch, dropping peer"
            );
            self.remove_peer(&from, events);
        }
    }

    // ----- timers -----

    /// Ping evasive peers, drop expired ones.
    pub fn tick(&mut self, now: Instant) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        for id in self.peers.ids() {
            let Some(peer) = self.peers.find_mut(&id) else { continue };
            if now >= peer.expired_at() {
                info!(peer = %id.short(), name = %peer.name, "peer expired");
                self.remove_peer(&id, &mut events);
            } else if now >= peer.evasive_at() && !peer.pinged() {
                peer.mark_pinged();
                let name = peer.name.clone();
                if self.send_to(&id, ZreMessage::Ping { sequence: 0 }, &mut events)
                    && self.entered.contains(&id)
                {
                    events.push(NodeEvent::Evasive { peer: id, name });
                }
            }
        }
        events
    }

    /// Earliest deadline the host should wake up for.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peers
            .all()
            .map(|p| if p.pinged() { p.expired_at() } else { p.evasive_at() })
            .min()
    }

    // ----- local commands -----

    pub fn join(&mut self, group: &str) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if !self.own_groups.insert(group.to_string()) {
            return events;
        }
        self.status = self.status.wrapping_add(1);
        info!(%group, status = self.status, "joined group");
        let msg = ZreMessage::Join {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        };
        self.broadcast(msg, &mut events);
        let g = self.groups.require(group);
        if g.contest && !g.is_empty() {
            g.invalidate();
            self.start_election(group, &mut events);
        }
        events
    }

    pub fn leave(&mut self, group: &str) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        if !self.own_groups.remove(group) {
            return events;
        }
        self.status = self.status.wrapping_add(1);
        info!(%group, status = self.status, "left group");
        let msg = ZreMessage::Leave {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        };
        self.broadcast(msg, &mut events);
        if let Some(g) = self.groups.get_mut(group) {
            g.invalidate();
        }
        let own = &self.own_groups;
        self.groups.collect_garbage(|name| own.contains(name));
        events
    }

    /// Send `content` to every member of `group`.
    pub fn shout(&mut self, group: &str, content: &[u8]) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let Some(g) = self.groups.get(group) else {
            return events;
        };
        for to in g.neighbors() {
            let msg = ZreMessage::Shout {
                sequence: 0,
                group: group.to_string(),
                content: content.to_vec(),
            };
            self.send_to(&to, msg, &mut events);
        }
        events
    }

    pub fn whisper(&mut self, peer: &PeerId, content: &[u8]) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let msg = ZreMessage::Whisper {
            sequence: 0,
            content: content.to_vec(),
        };
        if !self.send_to(peer, msg, &mut events) {
            debug!(peer = %peer.short(), "whisper to unknown or unreachable peer");
        }
        events
    }

    /// Declare willingness to lead `group`.
    pub fn set_contest(&mut self, group: &str) {
        self.groups.require(group).contest = true;
    }

    /// Originate an election wave in `group`. Only a contesting member may
    /// put itself forward.
    pub fn elect(&mut self, group: &str) -> Vec<NodeEvent> {
        let mut events = Vec::new();
        let contest = self.groups.get(group).is_some_and(|g| g.contest);
        if !self.own_groups.contains(group) || !contest {
            debug!(%group, "not a contesting member, election not started");
            return events;
        }
        self.start_election(group, &mut events);
        events
    }

    /// Say GOODBYE to every connected peer and forget them all.
    pub fn stop(&mut self) {
        for id in self.peers.ids() {
            if let Some(peer) = self.peers.find_mut(&id) {
                if peer.connected() {
                    if let Err(e) = peer.send(ZreMessage::Goodbye) {
                        debug!(peer = %id.short(), error = %e, "GOODBYE not sent");
                    }
                }
            }
            self.peers.remove(&id);
        }
        self.entered.clear();
    }

    // ----- queries -----

    /// Peers that have completed the handshake.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.all().filter(|p| p.ready).map(|p| p.id()).collect()
    }

    pub fn peers_by_group(&self, group: &str) -> Vec<PeerId> {
        self.groups
            .get(group)
            .map(|g| g.neighbors())
            .unwrap_or_default()
    }

    pub fn own_groups(&self) -> Vec<String> {
        self.own_groups.iter().cloned().collect()
    }

    /// Groups that have at least one remote member.
    pub fn peer_groups(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| !g.is_empty())
            .map(|g| g.name().to_string())
            .collect()
    }

    pub fn peer_endpoint(&self, peer: &PeerId) -> Option<String> {
        self.peers.find(peer)?.endpoint().map(str::to_owned)
    }

    pub fn peer_header(&self, peer: &PeerId, key: &str) -> Option<String> {
        self.peers.find(peer)?.headers.get(key).cloned()
    }

    pub fn leader(&self, group: &str) -> Option<PeerId> {
        self.groups.get(group)?.leader()
    }

    // ----- internals -----

    /// Make sure `id` exists with a live mailbox. A new peer is greeted with
    /// our HELLO. Returns false when the mailbox could not be opened.
    fn require_peer(
        &mut self,
        id: PeerId,
        endpoint: &str,
        now: Instant,
        events: &mut Vec<NodeEvent>,
    ) -> bool {
        if !self.peers.contains(&id) {
            // A restarted process comes back at the same endpoint with a new identity.
            let stale: Vec<PeerId> = self
                .peers
                .all()
                .filter(|p| p.endpoint() == Some(endpoint))
                .map(|p| p.id())
                .collect();
            for old in stale {
                debug!(peer = %old.short(), endpoint, "purging peer at reused endpoint");
                self.remove_peer(&old, events);
            }
        }
        let peer = self.peers.upsert(id, now);
        if peer.connected() {
            return true;
        }
        if let Err(e) = peer.connect(&mut self.connector, endpoint) {
            warn!(peer = %id.short(), error = %e, "cannot reach peer");
            self.peers.remove(&id);
            return false;
        }
        peer.refresh(now, self.config.evasive_timeout, self.config.expired_timeout);
        let hello = ZreMessage::Hello {
            sequence: 0,
            endpoint: self.config.endpoint.clone(),
            groups: self.own_groups.iter().cloned().collect(),
            status: self.status,
            name: self.config.name.clone(),
            headers: self.config.headers.clone(),
        };
        self.send_to(&id, hello, events)
    }

    fn remove_peer(&mut self, id: &PeerId, events: &mut Vec<NodeEvent>) {
        let Some(peer) = self.peers.remove(id) else { return };
        let left = self.groups.remove_peer_everywhere(id);
        if self.entered.remove(id) {
            info!(peer = %id.short(), name = %peer.name, "peer exited");
            events.push(NodeEvent::Exit {
                peer: *id,
                name: peer.name.clone(),
            });
        }
        for group in left {
            self.on_churn(&group, events);
        }
    }

    /// Returns false when the send failed; the peer is gone in that case.
    fn send_to(&mut self, id: &PeerId, msg: ZreMessage, events: &mut Vec<NodeEvent>) -> bool {
        let Some(peer) = self.peers.find_mut(id) else {
            return false;
        };
        trace!(peer = %id.short(), command = msg.command(), "send");
        match peer.send(msg) {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %id.short(), error = %e, "dropping unreachable peer");
                self.remove_peer(id, events);
                false
            }
        }
    }

    fn broadcast(&mut self, msg: ZreMessage, events: &mut Vec<NodeEvent>) {
        for id in self.peers.ids() {
            if self.peers.find(&id).is_some_and(|p| p.connected()) {
                self.send_to(&id, msg.clone(), events);
            }
        }
    }

    fn join_peer_group(&mut self, from: PeerId, group: &str, events: &mut Vec<NodeEvent>) -> bool {
        let Some(peer) = self.peers.find_mut(&from) else {
            return false;
        };
        let g = self.groups.require(group);
        if !g.join(peer) {
            return true;
        }
        debug!(peer = %from.short(), %group, "peer joined group");
        events.push(NodeEvent::Join {
            peer: from,
            name: peer.name.clone(),
            group: group.to_string(),
        });
        self.on_churn(group, events);
        true
    }

    fn leave_peer_group(&mut self, from: PeerId, group: &str, events: &mut Vec<NodeEvent>) -> bool {
        let Some(peer) = self.peers.find_mut(&from) else {
            return false;
        };
        let Some(g) = self.groups.get_mut(group) else {
            return true;
        };
        if !g.leave(peer) {
            return true;
        }
        debug!(peer = %from.short(), %group, "peer left group");
        events.push(NodeEvent::Leave {
            peer: from,
            name: peer.name.clone(),
            group: group.to_string(),
        });
        self.on_churn(group, events);
        true
    }

    /// Membership of `group` changed, so the current leader and any wave in
    /// flight are void. A new round opens, rooted at us when we contest or
    /// else at the best candidate still in the group.
    fn on_churn(&mut self, group: &str, events: &mut Vec<NodeEvent>) {
        if !self.own_groups.contains(group) {
            return;
        }
        let me = self.id;
        let Some(g) = self.groups.get_mut(group) else { return };
        if g.is_empty() {
            g.invalidate();
            return;
        }
        let candidate = if g.contest {
            Some(me)
        } else {
            g.election()
                .and_then(Election::candidate)
                .filter(|c| g.contains(c))
        };
        g.invalidate();
        let neighbors = g.neighbors();
        debug!(%group, members = neighbors.len(), "membership changed, new election round");
        let steps = g.require_election().restart(me, candidate, &neighbors);
        self.apply_steps(group, steps, events);
    }

    fn start_election(&mut self, group: &str, events: &mut Vec<NodeEvent>) {
        let me = self.id;
        let g = self.groups.require(group);
        let neighbors = g.neighbors();
        debug!(%group, members = neighbors.len(), "starting election");
        let steps = g.require_election().start(me, &neighbors);
        self.apply_steps(group, steps, events);
    }

    fn on_elect(
        &mut self,
        from: PeerId,
        group: &str,
        round: u32,
        challenger: PeerId,
        events: &mut Vec<NodeEvent>,
    ) {
        if !self.own_groups.contains(group) {
            trace!(%group, "ELECT for a group we are not in");
            return;
        }
        let me = self.id;
        let Some(g) = self.groups.get_mut(group) else { return };
        if !g.contains(&from) {
            trace!(%group, peer = %from.short(), "ELECT from non-member");
            return;
        }
        let contest = g.contest;
        let neighbors = g.neighbors();
        let steps = g
            .require_election()
            .on_elect(me, contest, from, round, challenger, &neighbors);
        self.apply_steps(group, steps, events);
    }

    fn on_leader(
        &mut self,
        from: PeerId,
        group: &str,
        round: u32,
        leader: PeerId,
        events: &mut Vec<NodeEvent>,
    ) {
        if !self.own_groups.contains(group) {
            trace!(%group, "LEADER for a group we are not in");
            return;
        }
        let me = self.id;
        let Some(g) = self.groups.get_mut(group) else { return };
        if !g.contains(&from) {
            trace!(%group, peer = %from.short(), "LEADER from non-member");
            return;
        }
        let neighbors = g.neighbors();
        let steps = g
            .require_election()
            .on_leader(me, round, leader, &neighbors);
        self.apply_steps(group, steps, events);
    }

    fn apply_steps(&mut self, group: &str, steps: Vec<ElectionStep>, events: &mut Vec<NodeEvent>) {
        for step in steps {
            match step {
                ElectionStep::Elect {
                    to,
                    round,
                    challenger,
                } => {
                    let msg = ZreMessage::Elect {
                        sequence: 0,
                        group: group.to_string(),
                        round,
                        challenger,
                    };
                    self.send_to(&to, msg, events);
                }
                ElectionStep::Leader { to, round, leader } => {
                    let msg = ZreMessage::Leader {
                        sequence: 0,
                        group: group.to_string(),
                        round,
                        leader,
                    };
                    self.send_to(&to, msg, events);
                }
                ElectionStep::Decided { leader } => {
                    if let Some(g) = self.groups.get_mut(group) {
                        g.set_leader(leader);
                    }
                    info!(%group, leader = %leader.short(), won = leader == self.id, "leader elected");
                    events.push(NodeEvent::Leader {
                        group: group.to_string(),
                        leader,
                    });
                }
            }
        }
    }
}
