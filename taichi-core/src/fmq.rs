//! File-sync wire grammar (FILEMQ v2).

use crate::codec::{DecodeError, EncodeError, Headers, Reader, Writer};

pub const FMQ_VERSION: u8 = 2;
/// Protocol tag carried by OHAI.
pub const FMQ_PROTOCOL: &str = "FILEMQ";
/// Protocol version carried by OHAI.
pub const FMQ_PROTOCOL_VERSION: u16 = 2;

const OHAI: u8 = 1;
const OHAI_OK: u8 = 4;
const ICANHAZ: u8 = 5;
const ICANHAZ_OK: u8 = 6;
const NOM: u8 = 7;
const CHEEZBURGER: u8 = 8;
const HUGZ: u8 = 9;
const HUGZ_OK: u8 = 10;
const KTHXBAI: u8 = 11;
const SRSLY: u8 = 128;
const RTFM: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create = 1,
    Delete = 2,
}

impl TryFrom<u8> for Operation {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Operation::Create),
            2 => Ok(Operation::Delete),
            other => Err(DecodeError::InvalidField {
                field: "operation",
                value: other.to_string(),
            }),
        }
    }
}

/// One patch streamed by the server. An empty `chunk` on a create marks
/// end-of-file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cheezburger {
    pub sequence: u64,
    pub operation: Operation,
    pub filename: String,
    pub offset: u64,
    pub eof: bool,
    pub headers: Headers,
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FmqMessage {
    Ohai { protocol: String, version: u16 },
    OhaiOk,
    Icanhaz {
        path: String,
        options: Headers,
        cache: Headers,
    },
    IcanhazOk,
    Nom { credit: u64, sequence: u64 },
    Cheezburger(Cheezburger),
    Hugz,
    HugzOk,
    Kthxbai,
    Srsly { reason: String },
    Rtfm { reason: String },
}

impl FmqMessage {
    /// OHAI with the protocol tag and version this client speaks.
    pub fn ohai() -> Self {
        FmqMessage::Ohai {
            protocol: FMQ_PROTOCOL.to_string(),
            version: FMQ_PROTOCOL_VERSION,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            FmqMessage::Ohai { .. } => "OHAI",
            FmqMessage::OhaiOk => "OHAI_OK",
            FmqMessage::Icanhaz { .. } => "ICANHAZ",
            FmqMessage::IcanhazOk => "ICANHAZ_OK",
            FmqMessage::Nom { .. } => "NOM",
            FmqMessage::Cheezburger(_) => "CHEEZBURGER",
            FmqMessage::Hugz => "HUGZ",
            FmqMessage::HugzOk => "HUGZ_OK",
            FmqMessage::Kthxbai => "KTHXBAI",
            FmqMessage::Srsly { .. } => "SRSLY",
            FmqMessage::Rtfm { .. } => "RTFM",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            FmqMessage::Ohai { .. } => OHAI,
            FmqMessage::OhaiOk => OHAI_OK,
            FmqMessage::Icanhaz { .. } => ICANHAZ,
            FmqMessage::IcanhazOk => ICANHAZ_OK,
            FmqMessage::Nom { .. } => NOM,
            FmqMessage::Cheezburger(_) => CHEEZBURGER,
            FmqMessage::Hugz => HUGZ,
            FmqMessage::HugzOk => HUGZ_OK,
            FmqMessage::Kthxbai => KTHXBAI,
            FmqMessage::Srsly { .. } => SRSLY,
            FmqMessage::Rtfm { .. } => RTFM,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut w = Writer::new(FMQ_VERSION, self.kind());
        match self {
            FmqMessage::Ohai { protocol, version } => {
                w.string("protocol", protocol)?;
                w.u16(*version);
            }
            FmqMessage::Icanhaz {
                path,
                options,
                cache,
            } => {
                w.longstr("path", path)?;
                w.hash("options", options)?;
                w.hash("cache", cache)?;
            }
            FmqMessage::Nom { credit, sequence } => {
                w.u64(*credit);
                w.u64(*sequence);
            }
            FmqMessage::Cheezburger(c) => {
                w.u64(c.sequence);
                w.u8(c.operation as u8);
                w.longstr("filename", &c.filename)?;
                w.u64(c.offset);
                w.u8(u8::from(c.eof));
                w.hash("headers", &c.headers)?;
                w.chunk("chunk", &c.chunk)?;
            }
            FmqMessage::Srsly { reason } | FmqMessage::Rtfm { reason } => {
                w.string("reason", reason)?;
            }
            FmqMessage::OhaiOk
            | FmqMessage::IcanhazOk
            | FmqMessage::Hugz
            | FmqMessage::HugzOk
            | FmqMessage::Kthxbai => {}
        }
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (mut r, kind) = Reader::open(bytes, FMQ_VERSION)?;
        let msg = match kind {
            OHAI => FmqMessage::Ohai {
                protocol: r.string("protocol")?,
                version: r.u16()?,
            },
            OHAI_OK => FmqMessage::OhaiOk,
            ICANHAZ => FmqMessage::Icanhaz {
                path: r.longstr("path")?,
                options: r.hash("options")?,
                cache: r.hash("cache")?,
            },
            ICANHAZ_OK => FmqMessage::IcanhazOk,
            NOM => FmqMessage::Nom {
                credit: r.u64()?,
                sequence: r.u64()?,
            },
            CHEEZBURGER => FmqMessage::Cheezburger(Cheezburger {
                sequence: r.u64()?,
                operation: Operation::try_from(r.u8()?)?,
                filename: r.longstr("filename")?,
                offset: r.u64()?,
                eof: r.u8()? != 0,
                headers: r.hash("headers")?,
                chunk: r.chunk()?,
            }),
            HUGZ => FmqMessage::Hugz,
            HUGZ_OK => FmqMessage::HugzOk,
            KTHXBAI => FmqMessage::Kthxbai,
            SRSLY => FmqMessage::Srsly {
                reason: r.string("reason")?,
            },
            RTFM => FmqMessage::Rtfm {
                reason: r.string("reason")?,
            },
            other => return Err(DecodeError::UnknownKind(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}
