//! Discovery beacon: one UDP datagram per interval, bincode-encoded.

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Bumped whenever the beacon or mailbox handshake changes shape.
pub const BEACON_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u8,
    pub peer_id: PeerId,
    /// TCP mailbox port. Zero announces that the sender is leaving.
    pub mailbox_port: u16,
}

impl Beacon {
    pub fn new(peer_id: PeerId, mailbox_port: u16) -> Self {
        Beacon {
            protocol_version: BEACON_VERSION,
            peer_id,
            mailbox_port,
        }
    }

    pub fn departure(peer_id: PeerId) -> Self {
        Self::new(peer_id, 0)
    }

    pub fn is_departure(&self) -> bool {
        self.mailbox_port == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, BeaconError> {
        Ok(bincode::serialize(self)?)
    }

    /// Rejects datagrams from other protocol versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, BeaconError> {
        let beacon: Beacon = bincode::deserialize(bytes)?;
        if beacon.protocol_version != BEACON_VERSION {
            return Err(BeaconError::Version(beacon.protocol_version));
        }
        Ok(beacon)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("beacon codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported beacon version {0}")]
    Version(u8),
}
