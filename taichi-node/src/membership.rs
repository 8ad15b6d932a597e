//! Membership loop: owns the engine, multiplexes commands, mailbox traffic,
//! beacons and the liveness clock. Callers talk to it through [`NodeHandle`].

use std::time::{Duration, Instant};

use taichi_core::{MembershipEngine, NodeEvent, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::Sighting;
use crate::transport::{Inbound, TcpConnector};

/// Upper bound on sleep when no peer deadline is pending.
const IDLE_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("membership loop has stopped")]
pub struct NodeStopped;

enum Command {
    Join(String),
    Leave(String),
    Shout { group: String, content: Vec<u8> },
    Whisper { peer: PeerId, content: Vec<u8> },
    SetContest(String),
    Elect(String),
    Peers(oneshot::Sender<Vec<PeerId>>),
    PeersByGroup(String, oneshot::Sender<Vec<PeerId>>),
    OwnGroups(oneshot::Sender<Vec<String>>),
    PeerGroups(oneshot::Sender<Vec<String>>),
    PeerEndpoint(PeerId, oneshot::Sender<Option<String>>),
    PeerHeader(PeerId, String, oneshot::Sender<Option<String>>),
    Leader(String, oneshot::Sender<Option<PeerId>>),
}

#[derive(Clone)]
pub struct NodeHandle {
    id: PeerId,
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    async fn send(&self, cmd: Command) -> Result<(), NodeStopped> {
        self.tx.send(cmd).await.map_err(|_| NodeStopped)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, NodeStopped> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| NodeStopped)
    }

    pub async fn join(&self, group: &str) -> Result<(), NodeStopped> {
        self.send(Command::Join(group.to_string())).await
    }

    pub async fn leave(&self, group: &str) -> Result<(), NodeStopped> {
        self.send(Command::Leave(group.to_string())).await
    }

    pub async fn shout(&self, group: &str, content: &[u8]) -> Result<(), NodeStopped> {
        self.send(Command::Shout {
            group: group.to_string(),
            content: content.to_vec(),
        })
        .await
    }

    pub async fn whisper(&self, peer: PeerId, content: &[u8]) -> Result<(), NodeStopped> {
        self.send(Command::Whisper {
            peer,
            content: content.to_vec(),
        })
        .await
    }

    pub async fn set_contest(&self, group: &str) -> Result<(), NodeStopped> {
        self.send(Command::SetContest(group.to_string())).await
    }

    pub async fn elect(&self, group: &str) -> Result<(), NodeStopped> {
        self.send(Command::Elect(group.to_string())).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerId>, NodeStopped> {
        self.ask(Command::Peers).await
    }

    pub async fn peers_by_group(&self, group: &str) -> Result<Vec<PeerId>, NodeStopped> {
        let group = group.to_string();
        self.ask(|r| Command::PeersByGroup(group, r)).await
    }

    pub async fn own_groups(&self) -> Result<Vec<String>, NodeStopped> {
        self.ask(Command::OwnGroups).await
    }

    pub async fn peer_groups(&self) -> Result<Vec<String>, NodeStopped> {
        self.ask(Command::PeerGroups).await
    }

    pub async fn peer_endpoint(&self, peer: PeerId) -> Result<Option<String>, NodeStopped> {
        self.ask(|r| Command::PeerEndpoint(peer, r)).await
    }

    pub async fn peer_header(&self, peer: PeerId, key: &str) -> Result<Option<String>, NodeStopped> {
        let key = key.to_string();
        self.ask(|r| Command::PeerHeader(peer, key, r)).await
    }

    pub async fn leader(&self, group: &str) -> Result<Option<PeerId>, NodeStopped> {
        let group = group.to_string();
        self.ask(|r| Command::Leader(group, r)).await
    }
}

pub struct Membership {
    engine: MembershipEngine<TcpConnector>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<Inbound>,
    sightings: mpsc::Receiver<Sighting>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Membership {
    pub fn new(
        engine: MembershipEngine<TcpConnector>,
        inbound: mpsc::Receiver<Inbound>,
        sightings: mpsc::Receiver<Sighting>,
    ) -> (Self, NodeHandle, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, commands) = mpsc::channel(64);
        let (events, events_rx) = mpsc::unbounded_channel();
        let handle = NodeHandle {
            id: engine.id(),
            tx,
        };
        let this = Self {
            engine,
            commands,
            inbound,
            sightings,
            events,
        };
        (this, handle, events_rx)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(id = %self.engine.id(), name = self.engine.name(), "membership started");
        loop {
            let wake = self
                .engine
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_TICK)
                .min(Instant::now() + IDLE_TICK);
            let events = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(cmd) = self.commands.recv() => self.on_command(cmd),
                Some(msg) = self.inbound.recv() => {
                    match self.engine.on_message(msg.from, &msg.payload, Instant::now()) {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(peer = %msg.from.short(), error = %e, "dropping malformed message");
                            Vec::new()
                        }
                    }
                }
                Some(sighting) = self.sightings.recv() => match sighting {
                    Sighting::Seen { peer, endpoint } => {
                        self.engine.on_beacon(peer, &endpoint, Instant::now())
                    }
                    Sighting::Departed(peer) => self.engine.on_beacon_departed(peer),
                },
                _ = tokio::time::sleep_until(wake.into()) => self.engine.tick(Instant::now()),
            };
            for event in events {
                debug!(?event, "node event");
                if let Err(e) = self.events.send(event) {
                    debug!(event = ?e.0, "event dropped, receiver gone");
                }
            }
        }
        self.engine.stop();
        info!("membership stopped");
    }

    fn on_command(&mut self, cmd: Command) -> Vec<NodeEvent> {
        let engine = &mut self.engine;
        match cmd {
            Command::Join(group) => return engine.join(&group),
            Command::Leave(group) => return engine.leave(&group),
            Command::Shout { group, content } => return engine.shout(&group, &content),
            Command::Whisper { peer, content } => return engine.whisper(&peer, &content),
            Command::SetContest(group) => engine.set_contest(&group),
            Command::Elect(group) => return engine.elect(&group),
            Command::Peers(r) => answer(r, engine.peers()),
            Command::PeersByGroup(group, r) => answer(r, engine.peers_by_group(&group)),
            Command::OwnGroups(r) => answer(r, engine.own_groups()),
            Command::PeerGroups(r) => answer(r, engine.peer_groups()),
            Command::PeerEndpoint(peer, r) => answer(r, engine.peer_endpoint(&peer)),
            Command::PeerHeader(peer, key, r) => answer(r, engine.peer_header(&peer, &key)),
            Command::Leader(group, r) => answer(r, engine.leader(&group)),
        }
        Vec::new()
    }
}

/// Reply to a query; the asker may have gone away.
fn answer<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("query dropped by caller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::run_listener;
    use taichi_core::{format_endpoint, NodeConfig};
    use tokio::net::TcpListener;
    use tokio_util::task::TaskTracker;

    struct TestNode {
        handle: NodeHandle,
        events: mpsc::UnboundedReceiver<NodeEvent>,
        sightings: mpsc::Sender<Sighting>,
        endpoint: String,
    }

    async fn start(name: &str, id: PeerId, tracker: &TaskTracker, cancel: &CancellationToken) -> TestNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format_endpoint(listener.local_addr().unwrap());
        let (in_tx, in_rx) = mpsc::channel(64);
        let (s_tx, s_rx) = mpsc::channel(16);
        tracker.spawn(run_listener(listener, in_tx, tracker.clone(), cancel.clone()));
        let connector = TcpConnector::new(id, tracker.clone(), Duration::from_secs(1));
        let engine = MembershipEngine::new(id, NodeConfig::new(name, endpoint.clone()), connector);
        let (membership, handle, events) = Membership::new(engine, in_rx, s_rx);
        tracker.spawn(membership.run(cancel.clone()));
        TestNode {
            handle,
            events,
            sightings: s_tx,
            endpoint,
        }
    }

    async fn next_matching(
        events: &mut mpsc::UnboundedReceiver<NodeEvent>,
        pred: impl Fn(&NodeEvent) -> bool,
    ) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = events.recv().await.expect("event stream ended");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn id(n: u8) -> PeerId {
        let mut b = [0u8; 16];
        b[15] = n;
        PeerId::from_bytes(b)
    }

    #[tokio::test]
    async fn two_nodes_meet_join_and_elect() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let mut a = start("alpha", id(1), &tracker, &cancel).await;
        let mut b = start("beta", id(2), &tracker, &cancel).await;

        for node in [&a, &b] {
            node.handle.set_contest("CHAT").await.unwrap();
            node.handle.join("CHAT").await.unwrap();
            assert_eq!(node.handle.own_groups().await.unwrap(), vec!["CHAT"]);
        }
        a.sightings
            .send(Sighting::Seen {
                peer: id(2),
                endpoint: b.endpoint.clone(),
            })
            .await
            .unwrap();

        let enter = next_matching(&mut b.events, |e| matches!(e, NodeEvent::Enter { .. })).await;
        assert!(matches!(enter, NodeEvent::Enter { peer, ref name, .. } if peer == id(1) && name == "alpha"));
        next_matching(&mut a.events, |e| matches!(e, NodeEvent::Enter { .. })).await;

        for node in [&mut a, &mut b] {
            let leader = next_matching(&mut node.events, |e| matches!(e, NodeEvent::Leader { .. })).await;
            assert_eq!(
                leader,
                NodeEvent::Leader {
                    group: "CHAT".into(),
                    leader: id(1)
                }
            );
        }
        assert_eq!(a.handle.leader("CHAT").await.unwrap(), Some(id(1)));
        assert_eq!(b.handle.peers_by_group("CHAT").await.unwrap(), vec![id(1)]);
        assert_eq!(
            b.handle.peer_endpoint(id(1)).await.unwrap(),
            Some(a.endpoint.clone())
        );

        a.handle.shout("CHAT", b"hello").await.unwrap();
        let shout = next_matching(&mut b.events, |e| matches!(e, NodeEvent::Shout { .. })).await;
        assert!(matches!(shout, NodeEvent::Shout { ref content, .. } if content == b"hello"));

        a.sightings.send(Sighting::Departed(id(2))).await.unwrap();
        next_matching(&mut a.events, |e| matches!(e, NodeEvent::Exit { .. })).await;
        assert!(a.handle.peers().await.unwrap().is_empty());

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(a.handle.peers().await.is_err());
    }
}
