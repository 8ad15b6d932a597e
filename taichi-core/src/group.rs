//! Group registry: named member sets plus per-group leader and election.
//!
//! Members are held by identity only. Removing a peer from the peer registry
//! never leaves a dangling reference here; lookups that miss mean the peer is
//! gone.

use std::collections::{BTreeMap, BTreeSet};

use crate::election::Election;
use crate::identity::PeerId;
use crate::peer::Peer;

#[derive(Debug, Clone, Default)]
pub struct Group {
    name: String,
    members: BTreeSet<PeerId>,
    /// Local node is willing to lead this group.
    pub contest: bool,
    leader: Option<PeerId>,
    election: Option<Election>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Group {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn neighbors(&self) -> Vec<PeerId> {
        self.members.iter().copied().collect()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.leader
    }

    pub fn set_leader(&mut self, leader: PeerId) {
        self.leader = Some(leader);
    }

    pub fn election(&self) -> Option<&Election> {
        self.election.as_ref()
    }

    /// The running election, created on first use.
    pub fn require_election(&mut self) -> &mut Election {
        self.election.get_or_insert_with(Election::new)
    }

    /// Forget the leader and abandon any wave in flight.
    pub fn invalidate(&mut self) {
        self.leader = None;
        if let Some(election) = self.election.as_mut() {
            election.abandon();
        }
    }

    /// Add a remote member and bump its status. Returns false when it was
    /// already a member, in which case nothing changes.
    pub fn join(&mut self, peer: &mut Peer) -> bool {
        if !self.members.insert(peer.id()) {
            return false;
        }
        peer.status = peer.status.wrapping_add(1);
        true
    }

    /// Remove a remote member and bump its status.
    pub fn leave(&mut self, peer: &mut Peer) -> bool {
        if !self.members.remove(&peer.id()) {
            return false;
        }
        peer.status = peer.status.wrapping_add(1);
        if self.members.is_empty() {
            self.invalidate();
        }
        true
    }

    /// Drop a member that has left the mesh entirely.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        let removed = self.members.remove(peer);
        if removed && self.members.is_empty() {
            self.invalidate();
        }
        removed
    }
}

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<String, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Remove the peer from every group; returns the names it was in.
    pub fn remove_peer_everywhere(&mut self, peer: &PeerId) -> Vec<String> {
        self.groups
            .values_mut()
            .filter_map(|g| g.forget(peer).then(|| g.name.clone()))
            .collect()
    }

    /// Drop empty groups that the local node does not contest.
    pub fn collect_garbage(&mut self, keep: impl Fn(&str) -> bool) {
        self.groups
            .retain(|name, g| !g.is_empty() || g.contest || keep(name));
    }
}
