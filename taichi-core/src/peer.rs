//! Peer registry: per-peer transport, liveness deadlines and sequence counters.
//!
//! The core never opens sockets. The host supplies a [`Connector`] that hands
//! back a [`Mailbox`] per peer; the registry only decides when to use it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::codec::{EncodeError, Headers};
use crate::endpoint::EndpointError;
use crate::identity::PeerId;
use crate::zre::ZreMessage;

/// Outbound point-to-point channel to one peer. `send` must not block: a full
/// queue is reported as [`TransportError::WouldBlock`].
pub trait Mailbox: Send {
    fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Opens mailboxes. Implemented by the host's transport.
pub trait Connector: Send {
    fn connect(&mut self, endpoint: &str) -> Result<Box<dyn Mailbox>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("send would block")]
    WouldBlock,
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} is already connected")]
    AlreadyConnected(PeerId),
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("peer {peer} unreachable: {source}")]
    Unreachable {
        peer: PeerId,
        #[source]
        source: TransportError,
    },
    #[error("connect to {peer} failed: {source}")]
    Connect {
        peer: PeerId,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

pub struct Peer {
    id: PeerId,
    mailbox: Option<Box<dyn Mailbox>>,
    endpoint: Option<String>,
    pub name: String,
    /// Set once the peer's HELLO has been accepted.
    pub ready: bool,
    /// Count of group changes announced by this peer, wrapping.
    pub status: u8,
    sent_sequence: u16,
    want_sequence: u16,
    evasive_at: Instant,
    expired_at: Instant,
    pinged: bool,
    pub headers: Headers,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("ready", &self.ready)
            .field("status", &self.status)
            .field("sent_sequence", &self.sent_sequence)
            .field("want_sequence", &self.want_sequence)
            .finish()
    }
}

impl Peer {
    pub fn new(id: PeerId, now: Instant) -> Self {
        Peer {
            id,
            mailbox: None,
            endpoint: None,
            name: id.short(),
            ready: false,
            status: 0,
            sent_sequence: 0,
            want_sequence: 0,
            evasive_at: now,
            expired_at: now,
            pinged: false,
            headers: Headers::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn connected(&self) -> bool {
        self.mailbox.is_some()
    }

    pub fn sent_sequence(&self) -> u16 {
        self.sent_sequence
    }

    pub fn want_sequence(&self) -> u16 {
        self.want_sequence
    }

    pub fn evasive_at(&self) -> Instant {
        self.evasive_at
    }

    pub fn expired_at(&self) -> Instant {
        self.expired_at
    }

    pub fn pinged(&self) -> bool {
        self.pinged
    }

    pub fn mark_pinged(&mut self) {
        self.pinged = true;
    }

    /// Open the outbound mailbox. Never replaces a live one.
    pub fn connect(
        &mut self,
        connector: &mut dyn Connector,
        endpoint: &str,
    ) -> Result<(), PeerError> {
        if self.connected() {
            return Err(PeerError::AlreadyConnected(self.id));
        }
        let mailbox = connector
            .connect(endpoint)
            .map_err(|source| PeerError::Connect {
                peer: self.id,
                source,
            })?;
        debug!(peer = %self.id.short(), endpoint, "mailbox connected");
        self.mailbox = Some(mailbox);
        self.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    /// Drop the mailbox and forget the endpoint. No-op when already down.
    pub fn disconnect(&mut self) {
        if self.mailbox.take().is_some() {
            debug!(peer = %self.id.short(), "mailbox disconnected");
        }
        self.endpoint = None;
        self.ready = false;
    }

    /// Stamp the next sequence number and transmit. A transport failure
    /// disconnects the peer; the caller has to wait for it to re-announce.
    pub fn send(&mut self, mut msg: ZreMessage) -> Result<(), PeerError> {
        let Some(mailbox) = self.mailbox.as_mut() else {
            return Err(PeerError::NotConnected(self.id));
        };
        let sequenced = msg.sequence().is_some();
        let next = self.sent_sequence.wrapping_add(1);
        if sequenced {
            msg.set_sequence(next);
        }
        let payload = msg.encode()?;
        match mailbox.send(payload) {
            Ok(()) => {
                if sequenced {
                    self.sent_sequence = next;
                }
                Ok(())
            }
            Err(source) => {
                warn!(peer = %self.id.short(), command = msg.command(), error = %source, "send failed, disconnecting");
                self.disconnect();
                Err(PeerError::Unreachable {
                    peer: self.id,
                    source,
                })
            }
        }
    }

    /// True when `msg` is not the next expected sequence. A HELLO always
    /// restarts the count at 1; GOODBYE is unsequenced.
    pub fn messages_lost(&mut self, msg: &ZreMessage) -> bool {
        let Some(recd) = msg.sequence() else {
            return false;
        };
        if matches!(msg, ZreMessage::Hello { .. }) {
            self.want_sequence = 1;
        } else {
            self.want_sequence = self.want_sequence.wrapping_add(1);
        }
        if self.want_sequence != recd {
            warn!(
                peer = %self.id.short(),
                command = msg.command(),
                expected = self.want_sequence,
                received = recd,
                "sequence error"
            );
            return true;
        }
        false
    }

    /// Push both liveness deadlines out from `now`.
    pub fn refresh(&mut self, now: Instant, evasive: Duration, expired: Duration) {
        self.evasive_at = now + evasive;
        self.expired_at = now + expired;
        self.pinged = false;
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create. An existing peer is returned untouched.
    pub fn upsert(&mut self, id: PeerId, now: Instant) -> &mut Peer {
        self.peers.entry(id).or_insert_with(|| Peer::new(id, now))
    }

    /// Remove and disconnect.
    pub fn remove(&mut self, id: &PeerId) -> Option<Peer> {
        let mut peer = self.peers.remove(id)?;
        peer.disconnect();
        Some(peer)
    }

    pub fn find(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn find_mut(&mut self, id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }
}
