//! Group-membership wire grammar (ZRE v2).
//!
//! Frame layout: version byte, kind byte, then the kind's fields. Every kind
//! except GOODBYE carries a 2-byte cyclic sequence number right after the
//! header.

use crate::codec::{DecodeError, EncodeError, Headers, Reader, Writer};
use crate::identity::PeerId;

pub const ZRE_VERSION: u8 = 2;

const HELLO: u8 = 1;
const WHISPER: u8 = 2;
const SHOUT: u8 = 3;
const JOIN: u8 = 4;
const LEAVE: u8 = 5;
const PING: u8 = 6;
const PING_OK: u8 = 7;
const ELECT: u8 = 8;
const LEADER: u8 = 9;
const GOODBYE: u8 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZreMessage {
    Hello {
        sequence: u16,
        endpoint: String,
        groups: Vec<String>,
        status: u8,
        name: String,
        headers: Headers,
    },
    Whisper {
        sequence: u16,
        content: Vec<u8>,
    },
    Shout {
        sequence: u16,
        group: String,
        content: Vec<u8>,
    },
    Join {
        sequence: u16,
        group: String,
        status: u8,
    },
    Leave {
        sequence: u16,
        group: String,
        status: u8,
    },
    Ping {
        sequence: u16,
    },
    PingOk {
        sequence: u16,
    },
    /// `round` orders restarts: a higher round supersedes every wave of a
    /// lower one.
    Elect {
        sequence: u16,
        group: String,
        round: u32,
        challenger: PeerId,
    },
    Leader {
        sequence: u16,
        group: String,
        round: u32,
        leader: PeerId,
    },
    Goodbye,
}

impl ZreMessage {
    pub fn command(&self) -> &'static str {
        match self {
            ZreMessage::Hello { .. } => "HELLO",
            ZreMessage::Whisper { .. } => "WHISPER",
            ZreMessage::Shout { .. } => "SHOUT",
            ZreMessage::Join { .. } => "JOIN",
            ZreMessage::Leave { .. } => "LEAVE",
            ZreMessage::Ping { .. } => "PING",
            ZreMessage::PingOk { .. } => "PING_OK",
            ZreMessage::Elect { .. } => "ELECT",
            ZreMessage::Leader { .. } => "LEADER",
            ZreMessage::Goodbye => "GOODBYE",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            ZreMessage::Hello { .. } => HELLO,
            ZreMessage::Whisper { .. } => WHISPER,
            ZreMessage::Shout { .. } => SHOUT,
            ZreMessage::Join { .. } => JOIN,
            ZreMessage::Leave { .. } => LEAVE,
            ZreMessage::Ping { .. } => PING,
            ZreMessage::PingOk { .. } => PING_OK,
            ZreMessage::Elect { .. } => ELECT,
            ZreMessage::Leader { .. } => LEADER,
            ZreMessage::Goodbye => GOODBYE,
        }
    }

    /// `None` for GOODBYE, which is not sequenced.
    pub fn sequence(&self) -> Option<u16> {
        match self {
            ZreMessage::Hello { sequence, .. }
            | ZreMessage::Whisper { sequence, .. }
            | ZreMessage::Shout { sequence, .. }
            | ZreMessage::Join { sequence, .. }
            | ZreMessage::Leave { sequence, .. }
            | ZreMessage::Ping { sequence }
            | ZreMessage::PingOk { sequence }
            | ZreMessage::Elect { sequence, .. }
            | ZreMessage::Leader { sequence, .. } => Some(*sequence),
            ZreMessage::Goodbye => None,
        }
    }

    pub fn set_sequence(&mut self, value: u16) {
        match self {
            ZreMessage::Hello { sequence, .. }
            | ZreMessage::Whisper { sequence, .. }
            | ZreMessage::Shout { sequence, .. }
            | ZreMessage::Join { sequence, .. }
            | ZreMessage::Leave { sequence, .. }
            | ZreMessage::Ping { sequence }
            | ZreMessage::PingOk { sequence }
            | ZreMessage::Elect { sequence, .. }
            | ZreMessage::Leader { sequence, .. } => *sequence = value,
            ZreMessage::Goodbye => {}
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new(ZRE_VERSION, self.kind());
        if let Some(seq) = self.sequence() {
            w.u16(seq);
        }
        match self {
            ZreMessage::Hello {
                endpoint,
                groups,
                status,
                name,
                headers,
                ..
            } => {
                w.string("endpoint", endpoint)?;
                w.strings("groups", groups)?;
                w.u8(*status);
                w.string("name", name)?;
                w.hash("headers", headers)?;
            }
            ZreMessage::Whisper { content, .. } => w.chunk("content", content)?,
            ZreMessage::Shout { group, content, .. } => {
                w.string("group", group)?;
                w.chunk("content", content)?;
            }
            ZreMessage::Join { group, status, .. } | ZreMessage::Leave { group, status, .. } => {
                w.string("group", group)?;
                w.u8(*status);
            }
            ZreMessage::Elect {
                group,
                round,
                challenger,
                ..
            } => {
                w.string("group", group)?;
                w.u32(*round);
                w.peer_id("challenger_id", challenger)?;
            }
            ZreMessage::Leader {
                group,
                round,
                leader,
                ..
            } => {
                w.string("group", group)?;
                w.u32(*round);
                w.peer_id("leader_id", leader)?;
            }
            ZreMessage::Ping { .. } | ZreMessage::PingOk { .. } | ZreMessage::Goodbye => {}
        }
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (mut r, kind) = Reader::open(bytes, ZRE_VERSION)?;
        if !(HELLO..=GOODBYE).contains(&kind) {
            return Err(DecodeError::UnknownKind(kind));
        }
        let sequence = if kind == GOODBYE { 0 } else { r.u16()? };
        let msg = match kind {
            HELLO => ZreMessage::Hello {
                sequence,
                endpoint: r.string("endpoint")?,
                groups: r.strings("groups")?,
                status: r.u8()?,
                name: r.string("name")?,
                headers: r.hash("headers")?,
            },
            WHISPER => ZreMessage::Whisper {
                sequence,
                content: r.chunk()?,
            },
            SHOUT => ZreMessage::Shout {
                sequence,
                group: r.string("group")?,
                content: r.chunk()?,
            },
            JOIN => ZreMessage::Join {
                sequence,
                group: r.string("group")?,
                status: r.u8()?,
            },
            LEAVE => ZreMessage::Leave {
                sequence,
                group: r.string("group")?,
                status: r.u8()?,
            },
            PING => ZreMessage::Ping { sequence },
            PING_OK => ZreMessage::PingOk { sequence },
            ELECT => ZreMessage::Elect {
                sequence,
                group: r.string("group")?,
                round: r.u32()?,
                challenger: r.peer_id("challenger_id")?,
            },
            LEADER => ZreMessage::Leader {
                sequence,
                group: r.string("group")?,
                round: r.u32()?,
                leader: r.peer_id("leader_id")?,
            },
            _ => ZreMessage::Goodbye,
        };
        r.finish()?;
        Ok(msg)
    }
}
