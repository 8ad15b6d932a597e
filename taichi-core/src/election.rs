//! Echo election of the minimum identity, one instance per group.
//!
//! A wave is named by its round and its candidate. Every node supports at most
//! one wave at a time (`caw`). It moves to any higher round it hears about and,
//! within a round, to any strictly lower candidate. A wave echoes back to its
//! root once every node has heard it from all of its neighbours; the root then
//! floods LEADER, and a node is decided once LEADER has arrived from every
//! neighbour.
//!
//! Membership churn opens a new round. Traffic from older rounds is never
//! counted, so a restarted wave cannot absorb echoes of the one it replaced.

use tracing::debug;

use crate::identity::PeerId;

/// Outbound work produced by the election; the membership engine turns it
/// into ELECT / LEADER messages or a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionStep {
    Elect {
        to: PeerId,
        round: u32,
        challenger: PeerId,
    },
    Leader {
        to: PeerId,
        round: u32,
        leader: PeerId,
    },
    Decided {
        leader: PeerId,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Election {
    round: u32,
    /// Currently active wave.
    caw: Option<PeerId>,
    father: Option<PeerId>,
    erec: usize,
    lrec: usize,
    leader: Option<PeerId>,
}

impl Election {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_decided(&self) -> bool {
        self.caw.is_none() && self.leader.is_some()
    }

    fn is_idle(&self) -> bool {
        self.caw.is_none() && self.leader.is_none()
    }

    /// The wave we support, or the leader we settled on.
    pub fn candidate(&self) -> Option<PeerId> {
        self.caw.or(self.leader)
    }

    /// Drop the wave in flight. The round is kept so its stragglers stay stale.
    pub fn abandon(&mut self) {
        *self = Election {
            round: self.round,
            ..Election::default()
        };
    }

    fn challenger_superior(&self, r: &PeerId) -> bool {
        match &self.caw {
            None => true,
            Some(caw) => r < caw,
        }
    }

    /// Originate a wave for `me` in a fresh round.
    pub fn start(&mut self, me: PeerId, neighbors: &[PeerId]) -> Vec<ElectionStep> {
        self.restart(me, Some(me), neighbors)
    }

    /// Open a fresh round rooted at `candidate`. With no candidate the node
    /// waits in the new round for someone else's wave.
    pub fn restart(
        &mut self,
        me: PeerId,
        candidate: Option<PeerId>,
        neighbors: &[PeerId],
    ) -> Vec<ElectionStep> {
        let mut out = Vec::new();
        self.round = self.round.saturating_add(1);
        self.abandon();
        if let Some(candidate) = candidate {
            self.begin_wave(candidate, None, neighbors, &mut out);
            self.check_echo(me, neighbors, &mut out);
        }
        out
    }

    /// Inbound ELECT(`round`, `challenger`) from neighbour `from`.
    pub fn on_elect(
        &mut self,
        me: PeerId,
        contest: bool,
        from: PeerId,
        round: u32,
        challenger: PeerId,
        neighbors: &[PeerId],
    ) -> Vec<ElectionStep> {
        let mut out = Vec::new();
        if round < self.round {
            // Idle in a newer round: carry a live candidate into it.
            if self.is_idle() && neighbors.contains(&challenger) {
                debug!(candidate = %challenger.short(), round = self.round, "carrying wave into current round");
                self.begin_wave(challenger, None, neighbors, &mut out);
                self.check_echo(me, neighbors, &mut out);
            }
            return out;
        }
        if round > self.round {
            self.round = round;
            self.abandon();
        }
        if self.is_decided() {
            return out;
        }
        if contest && me < challenger && self.challenger_superior(&me) {
            debug!(candidate = %me.short(), over = %challenger.short(), "contesting with own wave");
            self.begin_wave(me, None, neighbors, &mut out);
        }
        if self.challenger_superior(&challenger) {
            self.begin_wave(challenger, Some(from), neighbors, &mut out);
        }
        if self.caw == Some(challenger) {
            self.erec += 1;
            self.check_echo(me, neighbors, &mut out);
        }
        out
    }

    /// Inbound LEADER(`round`, `leader`) from a neighbour.
    pub fn on_leader(
        &mut self,
        me: PeerId,
        round: u32,
        leader: PeerId,
        neighbors: &[PeerId],
    ) -> Vec<ElectionStep> {
        let mut out = Vec::new();
        if round < self.round {
            return out;
        }
        if round > self.round {
            self.round = round;
            self.abandon();
        }
        if self.is_decided() {
            return out;
        }
        if self.leader.is_none() {
            self.announce(leader, neighbors, &mut out);
        }
        self.lrec += 1;
        self.check_leader(me, neighbors, &mut out);
        out
    }

    fn begin_wave(
        &mut self,
        candidate: PeerId,
        father: Option<PeerId>,
        neighbors: &[PeerId],
        out: &mut Vec<ElectionStep>,
    ) {
        self.abandon();
        self.caw = Some(candidate);
        self.father = father;
        for &to in neighbors {
            if Some(to) != father {
                out.push(ElectionStep::Elect {
                    to,
                    round: self.round,
                    challenger: candidate,
                });
            }
        }
    }

    fn check_echo(&mut self, me: PeerId, neighbors: &[PeerId], out: &mut Vec<ElectionStep>) {
        if self.erec != neighbors.len() {
            return;
        }
        let Some(caw) = self.caw else { return };
        match self.father {
            Some(father) => out.push(ElectionStep::Elect {
                to: father,
                round: self.round,
                challenger: caw,
            }),
            None if self.leader.is_none() => {
                self.announce(caw, neighbors, out);
                self.check_leader(me, neighbors, out);
            }
            None => {}
        }
    }

    fn announce(&mut self, leader: PeerId, neighbors: &[PeerId], out: &mut Vec<ElectionStep>) {
        self.leader = Some(leader);
        for &to in neighbors {
            out.push(ElectionStep::Leader {
                to,
                round: self.round,
                leader,
            });
        }
    }

    fn check_leader(&mut self, me: PeerId, neighbors: &[PeerId], out: &mut Vec<ElectionStep>) {
        if self.lrec != neighbors.len() {
            return;
        }
        if let Some(leader) = self.leader {
            self.caw = None;
            debug!(leader = %leader.short(), round = self.round, won = leader == me, "election decided");
            out.push(ElectionStep::Decided { leader });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, VecDeque};

    fn id(n: u8) -> PeerId {
        let mut b = [0u8; 16];
        b[15] = n;
        PeerId::from_bytes(b)
    }

    enum Msg {
        Elect(u32, PeerId),
        Leader(u32, PeerId),
    }

    /// Full mesh with FIFO links and random delivery order.
    struct Net {
        nodes: BTreeMap<PeerId, (Election, bool)>,
        links: BTreeMap<(PeerId, PeerId), VecDeque<Msg>>,
        decided: BTreeMap<PeerId, Vec<(u32, PeerId)>>,
    }

    impl Net {
        fn new(members: &[(u8, bool)]) -> Self {
            let mut net = Net {
                nodes: BTreeMap::new(),
                links: BTreeMap::new(),
                decided: BTreeMap::new(),
            };
            for &(n, contest) in members {
                net.add(n, contest);
            }
            net
        }

        fn add(&mut self, n: u8, contest: bool) {
            self.nodes.insert(id(n), (Election::new(), contest));
        }

        fn neighbors(&self, me: PeerId) -> Vec<PeerId> {
            self.nodes.keys().copied().filter(|p| *p != me).collect()
        }

        fn apply(&mut self, me: PeerId, steps: Vec<ElectionStep>) {
            let round = self.nodes[&me].0.round;
            for step in steps {
                match step {
                    ElectionStep::Elect {
                        to,
                        round,
                        challenger,
                    } => self
                        .links
                        .entry((me, to))
                        .or_default()
                        .push_back(Msg::Elect(round, challenger)),
                    ElectionStep::Leader { to, round, leader } => self
                        .links
                        .entry((me, to))
                        .or_default()
                        .push_back(Msg::Leader(round, leader)),
                    ElectionStep::Decided { leader } => {
                        self.decided.entry(me).or_default().push((round, leader))
                    }
                }
            }
        }

        fn start(&mut self, who: u8) {
            let me = id(who);
            let nb = self.neighbors(me);
            let steps = self.nodes.get_mut(&me).unwrap().0.start(me, &nb);
            self.apply(me, steps);
        }

        /// Every node sees the membership change at once; in-flight traffic stays queued.
        fn churn(&mut self) {
            for me in self.nodes.keys().copied().collect::<Vec<_>>() {
                let nb = self.neighbors(me);
                let (election, contest) = self.nodes.get_mut(&me).unwrap();
                let candidate = if *contest { Some(me) } else { election.candidate() };
                let steps = election.restart(me, candidate, &nb);
                self.apply(me, steps);
            }
        }

        /// Deliver up to `limit` messages; returns how many were delivered.
        fn run_at_most(&mut self, rng: &mut StdRng, limit: usize) -> usize {
            for delivered in 0..limit {
                let busy: Vec<(PeerId, PeerId)> = self
                    .links
                    .iter()
                    .filter(|(_, q)| !q.is_empty())
                    .map(|(k, _)| *k)
                    .collect();
                if busy.is_empty() {
                    return delivered;
                }
                let (from, to) = busy[rng.gen_range(0..busy.len())];
                let msg = self.links.get_mut(&(from, to)).unwrap().pop_front().unwrap();
                let nb = self.neighbors(to);
                let (election, contest) = self.nodes.get_mut(&to).unwrap();
                let steps = match msg {
                    Msg::Elect(r, c) => election.on_elect(to, *contest, from, r, c, &nb),
                    Msg::Leader(r, l) => election.on_leader(to, r, l, &nb),
                };
                self.apply(to, steps);
            }
            limit
        }

        fn run(&mut self, rng: &mut StdRng) {
            let delivered = self.run_at_most(rng, 100_000);
            assert!(delivered < 100_000, "election never went quiet");
        }

        fn assert_converged(&self, leader: PeerId) {
            for (me, (election, _)) in &self.nodes {
                assert!(election.is_decided(), "{me:?} undecided");
                assert_eq!(election.leader, Some(leader));
                let in_round: Vec<PeerId> = self.decided[me]
                    .iter()
                    .filter(|(r, _)| *r == election.round)
                    .map(|(_, l)| *l)
                    .collect();
                assert_eq!(in_round, vec![leader], "{me:?}");
            }
            let rounds: Vec<u32> = self.nodes.values().map(|(e, _)| e.round).collect();
            assert!(rounds.windows(2).all(|w| w[0] == w[1]), "rounds {rounds:?}");
        }
    }

    #[test]
    fn three_contesting_peers_elect_lowest() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut net = Net::new(&[(1, true), (2, true), (3, true)]);
            net.start(2);
            net.run(&mut rng);
            net.assert_converged(id(1));
        }
    }

    #[test]
    fn any_initiator_any_order() {
        for seed in 0..100 {
            let mut rng = StdRng::seed_from_u64(seed);
            let n = rng.gen_range(2..7u8);
            let members: Vec<(u8, bool)> = (1..=n).map(|i| (i * 10, true)).collect();
            let mut net = Net::new(&members);
            net.start(rng.gen_range(1..=n) * 10);
            net.run(&mut rng);
            net.assert_converged(id(10));
        }
    }

    #[test]
    fn crossing_waves_lower_wins() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut net = Net::new(&[(5, true), (9, true), (7, false), (8, false)]);
            net.start(9);
            net.start(5);
            net.run(&mut rng);
            net.assert_converged(id(5));
        }
    }

    #[test]
    fn non_contesting_relays_but_never_wins() {
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            // lowest id does not contest and never initiates
            let mut net = Net::new(&[(1, false), (2, true), (3, true)]);
            net.start(3);
            net.run(&mut rng);
            net.assert_converged(id(2));
        }
    }

    #[test]
    fn join_mid_wave_settles_on_new_round() {
        for seed in 0..300 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut net = Net::new(&[(1, true), (2, true), (3, false)]);
            net.start(2);
            let cut = rng.gen_range(0..16);
            net.run_at_most(&mut rng, cut);
            net.add(4, seed % 2 == 0);
            net.churn();
            net.run(&mut rng);
            net.assert_converged(id(1));
        }
    }

    #[test]
    fn single_member_decides_immediately() {
        let me = id(4);
        let mut e = Election::new();
        let steps = e.start(me, &[]);
        assert_eq!(steps, vec![ElectionStep::Decided { leader: me }]);
        assert!(e.is_decided());
        assert_eq!(e.leader, Some(me));
    }

    #[test]
    fn start_opens_a_new_round() {
        let mut e = Election::new();
        let steps = e.on_elect(id(3), false, id(1), 1, id(1), &[id(1), id(2)]);
        assert_eq!(
            steps,
            vec![ElectionStep::Elect {
                to: id(2),
                round: 1,
                challenger: id(1)
            }]
        );
        assert_eq!(e.father, Some(id(1)));
        let steps = e.start(id(3), &[id(1), id(2)]);
        assert_eq!(steps.len(), 2);
        assert!(steps
            .iter()
            .all(|s| matches!(s, ElectionStep::Elect { round: 2, challenger, .. } if *challenger == id(3))));
        assert_eq!((e.round, e.caw, e.father), (2, Some(id(3)), None));
    }

    #[test]
    fn older_round_is_not_counted() {
        let nb = [id(2), id(3)];
        let mut e = Election::new();
        e.start(id(1), &nb);
        e.start(id(1), &nb);
        assert_eq!(e.round, 2);
        // echoes of round 1 must not complete round 2
        assert!(e.on_elect(id(1), true, id(2), 1, id(1), &nb).is_empty());
        assert!(e.on_elect(id(1), true, id(3), 1, id(1), &nb).is_empty());
        assert!(e.on_leader(id(1), 1, id(1), &nb).is_empty());
        assert_eq!(e.erec, 0);
        assert!(!e.is_decided());
    }

    #[test]
    fn higher_round_replaces_wave() {
        let nb = [id(1), id(3)];
        let mut e = Election::new();
        e.start(id(2), &nb);
        let steps = e.on_elect(id(2), false, id(3), 5, id(3), &nb);
        assert_eq!(
            steps,
            vec![ElectionStep::Elect {
                to: id(1),
                round: 5,
                challenger: id(3)
            }]
        );
        assert_eq!((e.round, e.caw, e.erec), (5, Some(id(3)), 1));
    }

    #[test]
    fn idle_node_carries_straggler_into_its_round() {
        let nb = [id(1), id(2)];
        let mut e = Election::new();
        assert!(e.restart(id(3), None, &nb).is_empty());
        let steps = e.on_elect(id(3), false, id(2), 0, id(1), &nb);
        assert_eq!(
            steps,
            vec![
                ElectionStep::Elect {
                    to: id(1),
                    round: 1,
                    challenger: id(1)
                },
                ElectionStep::Elect {
                    to: id(2),
                    round: 1,
                    challenger: id(1)
                },
            ]
        );
        assert_eq!(e.father, None);
        // a candidate that is no longer a neighbour is not carried
        let mut e = Election::new();
        e.restart(id(3), None, &nb);
        assert!(e.on_elect(id(3), false, id(2), 0, id(9), &nb).is_empty());
    }

    #[test]
    fn abandon_keeps_round() {
        let mut e = Election::new();
        e.start(id(1), &[id(2)]);
        e.abandon();
        assert_eq!((e.round, e.candidate()), (1, None));
    }

    #[test]
    fn decided_iff_no_wave_and_leader() {
        let mut e = Election::new();
        assert!(!e.is_decided());
        e.start(id(1), &[id(2)]);
        assert!(!e.is_decided());
        e.on_elect(id(1), true, id(2), 1, id(1), &[id(2)]);
        assert_eq!(e.leader, Some(id(1)));
        assert!(!e.is_decided());
        let steps = e.on_leader(id(1), 1, id(1), &[id(2)]);
        assert_eq!(steps, vec![ElectionStep::Decided { leader: id(1) }]);
        assert!(e.is_decided());
        assert_eq!(e.candidate(), Some(id(1)));
        assert!(e.on_leader(id(1), 1, id(1), &[id(2)]).is_empty());
        assert!(e.on_elect(id(1), true, id(2), 1, id(2), &[id(2)]).is_empty());
    }
}
