//! Stream framing: length-prefix (4 bytes LE) + encoded message payload.
//! Also the mailbox handshake a peer writes once when it opens a connection.

use crate::identity::PeerId;
use crate::zre::ZRE_VERSION;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Version byte + sender identity.
pub const HANDSHAKE_SIZE: usize = 1 + 16;

/// Wrap one encoded message into a frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Payload length announced by a frame header.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(len));
    }
    Ok(len as usize)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(u32),
}

/// Routing identity sent out-of-band before the first frame on a mailbox connection.
pub fn handshake_bytes(id: &PeerId) -> [u8; HANDSHAKE_SIZE] {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = ZRE_VERSION;
    out[1..].copy_from_slice(id.as_bytes());
    out
}

pub fn parse_handshake(bytes: &[u8; HANDSHAKE_SIZE]) -> Option<PeerId> {
    if bytes[0] != ZRE_VERSION {
        return None;
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[1..]);
    Some(PeerId::from_bytes(id))
}
