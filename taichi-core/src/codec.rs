//! Field-level reader/writer shared by the ZRE and FILEMQ grammars.
//!
//! All integers are big-endian. Field shapes:
//! - `string`: 1-byte length + UTF-8
//! - `longstr`: 4-byte length + UTF-8
//! - `strings`: 4-byte count + `longstr` each
//! - `hash`: 4-byte count + (`string` key, `longstr` value) each
//! - `chunk`: 4-byte length + raw bytes

use std::collections::BTreeMap;

use crate::identity::PeerId;

/// Key/value metadata carried by HELLO, ICANHAZ and CHEEZBURGER.
pub type Headers = BTreeMap<String, String>;

/// Malformed input. Never fatal to an engine: the frame is dropped and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated message: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("field {field} has invalid value {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("field {field} is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(version: u8, kind: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.push(version);
        buf.push(kind);
        Writer { buf }
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn len32(&mut self, field: &'static str, len: usize) -> Result<(), EncodeError> {
        let n = u32::try_from(len).map_err(|_| EncodeError::FieldTooLong {
            field,
            len,
            max: u32::MAX as usize,
        })?;
        self.u32(n);
        Ok(())
    }

    pub fn string(&mut self, field: &'static str, s: &str) -> Result<(), EncodeError> {
        let len = u8::try_from(s.len()).map_err(|_| EncodeError::FieldTooLong {
            field,
            len: s.len(),
            max: u8::MAX as usize,
        })?;
        self.buf.push(len);
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn longstr(&mut self, field: &'static str, s: &str) -> Result<(), EncodeError> {
        self.len32(field, s.len())?;
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    pub fn strings(&mut self, field: &'static str, list: &[String]) -> Result<(), EncodeError> {
        self.len32(field, list.len())?;
        for s in list {
            self.longstr(field, s)?;
        }
        Ok(())
    }

    pub fn hash(&mut self, field: &'static str, map: &Headers) -> Result<(), EncodeError> {
        self.len32(field, map.len())?;
        for (k, v) in map {
            self.string(field, k)?;
            self.longstr(field, v)?;
        }
        Ok(())
    }

    pub fn chunk(&mut self, field: &'static str, data: &[u8]) -> Result<(), EncodeError> {
        self.len32(field, data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn peer_id(&mut self, field: &'static str, id: &PeerId) -> Result<(), EncodeError> {
        self.string(field, &id.to_string())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Validate the two-byte header. Returns the reader positioned after it
    /// and the kind tag.
    pub fn open(buf: &'a [u8], version: u8) -> Result<(Self, u8), DecodeError> {
        let mut r = Reader { buf, pos: 0 };
        let v = r.u8()?;
        if v != version {
            return Err(DecodeError::UnsupportedVersion(v));
        }
        let kind = r.u8()?;
        Ok((r, kind))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(DecodeError::Truncated {
                offset: self.pos,
                needed: n,
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn utf8(field: &'static str, bytes: &[u8]) -> Result<String, DecodeError> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8(field))
    }

    pub fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u8()? as usize;
        Self::utf8(field, self.take(len)?)
    }

    pub fn longstr(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        Self::utf8(field, self.take(len)?)
    }

    /// Counts are bounded by what is left in the buffer, so a forged count
    /// cannot drive a huge allocation.
    fn count(&mut self, min_item: usize) -> Result<usize, DecodeError> {
        let n = self.u32()? as usize;
        let remaining = self.buf.len() - self.pos;
        if n.saturating_mul(min_item) > remaining {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                needed: n.saturating_mul(min_item),
            });
        }
        Ok(n)
    }

    pub fn strings(&mut self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        let n = self.count(4)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.longstr(field)?);
        }
        Ok(out)
    }

    pub fn hash(&mut self, field: &'static str) -> Result<Headers, DecodeError> {
        let n = self.count(5)?;
        let mut out = Headers::new();
        for _ in 0..n {
            let k = self.string(field)?;
            let v = self.longstr(field)?;
            out.insert(k, v);
        }
        Ok(out)
    }

    pub fn chunk(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn peer_id(&mut self, field: &'static str) -> Result<PeerId, DecodeError> {
        let s = self.string(field)?;
        s.parse().map_err(|_| DecodeError::InvalidField { field, value: s })
    }

    pub fn finish(self) -> Result<(), DecodeError> {
        let rest = self.buf.len() - self.pos;
        if rest == 0 {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(rest))
        }
    }
}
