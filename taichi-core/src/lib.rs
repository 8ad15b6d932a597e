//! Taichi LAN file distribution: protocol engines.
//! Host-driven: no sockets or timers here; the host feeds messages, beacons
//! and clock ticks in and carries the resulting traffic and events out.

pub mod beacon;
pub mod client;
pub mod codec;
pub mod election;
pub mod endpoint;
pub mod fmq;
pub mod group;
pub mod identity;
pub mod inbox;
pub mod node;
pub mod peer;
pub mod wire;
pub mod zre;

pub use beacon::{Beacon, BeaconError, BEACON_VERSION};
pub use client::{
    ClientEngine, ClientOutput, Event as ClientEvent, Notification, Reply, ServerLink,
    State as ClientState,
};
pub use codec::{DecodeError, EncodeError, Headers};
pub use endpoint::{file_service_endpoint, format_endpoint, parse_endpoint, EndpointError};
pub use fmq::{Cheezburger, FmqMessage, Operation};
pub use identity::PeerId;
pub use node::{MembershipEngine, NodeConfig, NodeEvent, FILE_SERVICE_MARKER};
pub use peer::{Connector, Mailbox, PeerError, TransportError};
pub use wire::{
    encode_frame, frame_len, handshake_bytes, parse_handshake, FrameDecodeError,
    FrameEncodeError, HANDSHAKE_SIZE,
};
pub use zre::ZreMessage;
