//! Node identity: a random 16-byte token per process instance.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Peer identity. Ordering is lexicographic over the raw bytes, which matches
/// the ordering of the uppercase hex form carried on the wire.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Fresh random identity for this process instance.
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 6 hex digits, used in log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(6);
        s
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid peer identity: {0:?}")]
pub struct ParsePeerIdError(String);

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    /// Accepts the 32-digit hex form (either case).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParsePeerIdError(s.to_string()));
        }
        uuid::Uuid::try_parse(s)
            .map(|u| PeerId(u.into_bytes()))
            .map_err(|_| ParsePeerIdError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let id = PeerId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s, s.to_uppercase());
        assert_eq!(s.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn ordering_matches_hex_ordering() {
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        a[15] = 0x0A;
        b[15] = 0xA0;
        let (a, b) = (PeerId::from_bytes(a), PeerId::from_bytes(b));
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<PeerId>().is_err());
        assert!("zz".repeat(16).parse::<PeerId>().is_err());
        assert!("0123-4567".parse::<PeerId>().is_err());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }
}
