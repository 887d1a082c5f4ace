//! Frame codec.
//!
//! | frame            | layout                                                                   |
//! |------------------|--------------------------------------------------------------------------|
//! | message          | `[100][rlen:2][elen:2][role][event][payload]`                            |
//! | request          | `[101][rlen:2][elen:2][clen:1][role][event][corr][payload]`              |
//! | stream request   | `[103/104][rlen:2][elen:2][clen:1][xlen:1][role][event][corr][ctl][payload]` |
//! | response/reject  | `[102/105][clen:1][corr][payload]`                                       |
//! | stream resolve   | `[107/108][clen:1][xlen:1][corr][ctl][payload]`                          |
//! | stream message   | `[106][slen:1][sid][flag][body]`                                         |
//! | acquaint/roles   | `[200/201][json]`                                                        |

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::payload::{Body, Payload};
use super::{decode_number, encode_number, tag};
use crate::error::{MeshError, Result};
use crate::identity::PeerId;

/// Control flag of a stream message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamFlag {
    Chunk,
    Finish,
    Error,
    Quota,
}

impl StreamFlag {
    pub fn byte(self) -> u8 {
        match self {
            Self::Chunk => 0,
            Self::Finish => 1,
            Self::Error => 2,
            Self::Quota => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Self::Chunk),
            1 => Ok(Self::Finish),
            2 => Ok(Self::Error),
            3 => Ok(Self::Quota),
            other => Err(MeshError::Protocol(format!("unknown stream flag {other}"))),
        }
    }
}

/// What the opener of a stream wants to get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamDirection {
    /// The opener reads; the remote handler gets a writer.
    Readable,
    /// The opener writes; the remote handler gets a reader.
    Writable,
}

/// Service-discovery hint about another peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquaintMessage {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// The set of active roles of the sending peer, stamped with a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolesUpdate {
    pub i: u64,
    pub roles: Vec<String>,
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message {
        role: String,
        event: String,
        body: Body,
    },
    Request {
        role: String,
        event: String,
        correlation: u64,
        body: Body,
    },
    StreamRequest {
        direction: StreamDirection,
        role: String,
        event: String,
        correlation: u64,
        control: u64,
        body: Body,
    },
    Response {
        correlation: u64,
        body: Body,
    },
    Reject {
        correlation: u64,
        body: Body,
    },
    StreamResolve {
        correlation: u64,
        control: u64,
        body: Body,
    },
    StreamReject {
        correlation: u64,
        control: u64,
        body: Body,
    },
    StreamMessage {
        stream_id: u64,
        flag: StreamFlag,
        body: Bytes,
    },
    Acquaint(AcquaintMessage),
    Roles(RolesUpdate),
}

impl Frame {
    /// Reject frame carrying a plain error message.
    pub fn reject(correlation: u64, message: &str) -> Self {
        Self::Reject {
            correlation,
            body: Payload::from(message).into(),
        }
    }

    /// Stream reject frame; the message is wrapped as `{"data": message}`.
    pub fn stream_reject(correlation: u64, message: &str) -> Self {
        let wrapped = serde_json::json!({ "data": message }).to_string();
        Self::StreamReject {
            correlation,
            control: 0,
            body: Payload::String(wrapped).into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        match self {
            Self::Message { role, event, body } => {
                out.put_u8(tag::MESSAGE);
                put_len16(&mut out, role)?;
                put_len16(&mut out, event)?;
                out.put_slice(role.as_bytes());
                out.put_slice(event.as_bytes());
                body.write_to(&mut out);
            }
            Self::Request {
                role,
                event,
                correlation,
                body,
            } => {
                let corr = encode_number(*correlation);
                out.put_u8(tag::REQUEST);
                put_len16(&mut out, role)?;
                put_len16(&mut out, event)?;
                out.put_u8(corr.len() as u8);
                out.put_slice(role.as_bytes());
                out.put_slice(event.as_bytes());
                out.put_slice(&corr);
                body.write_to(&mut out);
            }
            Self::StreamRequest {
                direction,
                role,
                event,
                correlation,
                control,
                body,
            } => {
                let corr = encode_number(*correlation);
                let ctl = encode_number(*control);
                out.put_u8(match direction {
                    StreamDirection::Readable => tag::REQUEST_READABLE,
                    StreamDirection::Writable => tag::REQUEST_WRITABLE,
                });
                put_len16(&mut out, role)?;
                put_len16(&mut out, event)?;
                out.put_u8(corr.len() as u8);
                out.put_u8(ctl.len() as u8);
                out.put_slice(role.as_bytes());
                out.put_slice(event.as_bytes());
                out.put_slice(&corr);
                out.put_slice(&ctl);
                body.write_to(&mut out);
            }
            Self::Response { correlation, body } | Self::Reject { correlation, body } => {
                let corr = encode_number(*correlation);
                out.put_u8(if matches!(self, Self::Response { .. }) {
                    tag::RESPONSE
                } else {
                    tag::REJECT
                });
                out.put_u8(corr.len() as u8);
                out.put_slice(&corr);
                body.write_to(&mut out);
            }
            Self::StreamResolve {
                correlation,
                control,
                body,
            }
            | Self::StreamReject {
                correlation,
                control,
                body,
            } => {
                let corr = encode_number(*correlation);
                let ctl = encode_number(*control);
                out.put_u8(if matches!(self, Self::StreamResolve { .. }) {
                    tag::STREAM_RESOLVE
                } else {
                    tag::STREAM_REJECT
                });
                out.put_u8(corr.len() as u8);
                out.put_u8(ctl.len() as u8);
                out.put_slice(&corr);
                out.put_slice(&ctl);
                body.write_to(&mut out);
            }
            Self::StreamMessage {
                stream_id,
                flag,
                body,
            } => {
                out.put_slice(&stream_header(*stream_id));
                out.put_u8(flag.byte());
                out.put_slice(body);
            }
            Self::Acquaint(message) => {
                out.put_u8(tag::ACQUAINT);
                out.put_slice(&serde_json::to_vec(message)?);
            }
            Self::Roles(update) => {
                out.put_u8(tag::ROLES);
                out.put_slice(&serde_json::to_vec(update)?);
            }
        }
        Ok(out.freeze())
    }

    pub fn decode(bytes: Bytes) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let kind = cursor.u8()?;
        match kind {
            tag::MESSAGE => {
                let rlen = cursor.u16()?;
                let elen = cursor.u16()?;
                let role = cursor.text(rlen as usize)?;
                let event = cursor.text(elen as usize)?;
                Ok(Self::Message {
                    role,
                    event,
                    body: Body::parse(cursor.rest())?,
                })
            }
            tag::REQUEST => {
                let rlen = cursor.u16()?;
                let elen = cursor.u16()?;
                let clen = cursor.u8()?;
                let role = cursor.text(rlen as usize)?;
                let event = cursor.text(elen as usize)?;
                let correlation = cursor.number(clen)?;
                Ok(Self::Request {
                    role,
                    event,
                    correlation,
                    body: Body::parse(cursor.rest())?,
                })
            }
            tag::REQUEST_READABLE | tag::REQUEST_WRITABLE => {
                let rlen = cursor.u16()?;
                let elen = cursor.u16()?;
                let clen = cursor.u8()?;
                let xlen = cursor.u8()?;
                let role = cursor.text(rlen as usize)?;
                let event = cursor.text(elen as usize)?;
                let correlation = cursor.number(clen)?;
                let control = cursor.number(xlen)?;
                Ok(Self::StreamRequest {
                    direction: if kind == tag::REQUEST_READABLE {
                        StreamDirection::Readable
                    } else {
                        StreamDirection::Writable
                    },
                    role,
                    event,
                    correlation,
                    control,
                    body: Body::parse(cursor.rest())?,
                })
            }
            tag::RESPONSE | tag::REJECT => {
                let clen = cursor.u8()?;
                let correlation = cursor.number(clen)?;
                let body = Body::parse(cursor.rest())?;
                Ok(if kind == tag::RESPONSE {
                    Self::Response { correlation, body }
                } else {
                    Self::Reject { correlation, body }
                })
            }
            tag::STREAM_RESOLVE | tag::STREAM_REJECT => {
                let clen = cursor.u8()?;
                let xlen = cursor.u8()?;
                let correlation = cursor.number(clen)?;
                let control = cursor.number(xlen)?;
                let body = Body::parse(cursor.rest())?;
                Ok(if kind == tag::STREAM_RESOLVE {
                    Self::StreamResolve {
                        correlation,
                        control,
                        body,
                    }
                } else {
                    Self::StreamReject {
                        correlation,
                        control,
                        body,
                    }
                })
            }
            tag::STREAM_MESSAGE => {
                let slen = cursor.u8()?;
                let stream_id = cursor.number(slen)?;
                let flag = StreamFlag::from_byte(cursor.u8()?)?;
                Ok(Self::StreamMessage {
                    stream_id,
                    flag,
                    body: cursor.rest(),
                })
            }
            tag::ACQUAINT => Ok(Self::Acquaint(cursor.json()?)),
            tag::ROLES => Ok(Self::Roles(cursor.json()?)),
            other => Err(MeshError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// `[106][slen][sid]`, the prefix of every stream message addressed to `stream_id`.
pub fn stream_header(stream_id: u64) -> Bytes {
    let sid = encode_number(stream_id);
    let mut out = BytesMut::with_capacity(2 + sid.len());
    out.put_u8(tag::STREAM_MESSAGE);
    out.put_u8(sid.len() as u8);
    out.put_slice(&sid);
    out.freeze()
}

fn put_len16(out: &mut BytesMut, field: &str) -> Result<()> {
    let len = u16::try_from(field.len()).map_err(|_| {
        MeshError::Protocol(format!("name of {} bytes exceeds 65535", field.len()))
    })?;
    out.put_u16(len);
    Ok(())
}

struct Cursor {
    buf: Bytes,
    pos: usize,
}

impl Cursor {
    fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(MeshError::Protocol(format!(
                "truncated frame: need {end} bytes, have {}",
                self.buf.len()
            )));
        }
        let slice = self.buf.slice(self.pos..end);
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn text(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.take(len)?).into_owned())
    }

    fn number(&mut self, len: u8) -> Result<u64> {
        decode_number(&self.take(len as usize)?)
    }

    fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let rest = self.rest();
        serde_json::from_slice(&rest)
            .map_err(|e| MeshError::Protocol(format!("malformed control frame: {e}")))
    }

    fn rest(&mut self) -> Bytes {
        let rest = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        rest
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
