//! Typed payloads: `[datatype tag][bytes]`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{MeshError, Result};

/// Datatype tag preceding every payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Binary,
    Null,
    Boolean,
    String,
    Number,
    Json,
    /// A tag this implementation does not know; decoded as null.
    Unknown(u8),
}

impl DataKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Binary => 0,
            Self::Null => 1,
            Self::Boolean => 2,
            Self::String => 3,
            Self::Number => 4,
            Self::Json => 5,
            Self::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: u8) -> Self {
        match tag {
            0 => Self::Binary,
            1 => Self::Null,
            2 => Self::Boolean,
            3 => Self::String,
            4 => Self::Number,
            5 => Self::Json,
            other => Self::Unknown(other),
        }
    }
}

/// A value carried by messages, requests, responses and stream handshakes.
///
/// `None` converts to [`Payload::Null`], so "no value" and "null" are the
/// same thing once they crossed the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Binary(Bytes),
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize any value to a payload, keeping scalars as scalars.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(serde_json::to_value(value)?.into())
    }

    /// Deserialize the payload into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }

    pub fn kind(&self) -> DataKind {
        match self {
            Self::Null => DataKind::Null,
            Self::Bool(_) => DataKind::Boolean,
            Self::Number(_) => DataKind::Number,
            Self::String(_) => DataKind::String,
            Self::Binary(_) => DataKind::Binary,
            Self::Json(_) => DataKind::Json,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The payload as a JSON value. Binary becomes an array of byte values.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::String(s) => Value::String(s.clone()),
            Self::Binary(b) => Value::Array(b.iter().map(|x| Value::from(*x)).collect()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Human-readable rendering, used for error messages.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => format_number(*n),
            Self::String(s) => s.clone(),
            Self::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Json(v) => v.to_string(),
        }
    }

    /// The value bytes without the datatype tag.
    pub fn encode_value(&self) -> Bytes {
        match self {
            Self::Null => Bytes::new(),
            Self::Bool(b) => Bytes::from_static(if *b { &[1] } else { &[0] }),
            Self::Number(n) => Bytes::from(format_number(*n)),
            Self::String(s) => Bytes::from(s.clone()),
            Self::Binary(b) => b.clone(),
            Self::Json(v) => Bytes::from(v.to_string()),
        }
    }

    /// Decode a value from its datatype and the bytes that followed the tag.
    pub fn decode_value(kind: DataKind, raw: &Bytes) -> Result<Self> {
        Ok(match kind {
            DataKind::Binary => Self::Binary(raw.clone()),
            DataKind::Null | DataKind::Unknown(_) => Self::Null,
            DataKind::Boolean => Self::Bool(raw.first() != Some(&0)),
            DataKind::String => Self::String(String::from_utf8_lossy(raw).into_owned()),
            DataKind::Number => Self::Number(parse_number(&String::from_utf8_lossy(raw))),
            DataKind::Json => {
                let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| {
                    MeshError::Protocol(format!("malformed JSON payload: {e}"))
                })?;
                Self::Json(value)
            }
        })
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else {
        format!("{n}")
    }
}

fn parse_number(text: &str) -> f64 {
    let text = text.trim();
    match text {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        other => other.parse().unwrap_or(f64::NAN),
    }
}

/// The undecoded bytes of a payload and their datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct Origin {
    pub raw: Bytes,
    pub kind: DataKind,
}

/// A payload together with its wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub payload: Payload,
    pub origin: Origin,
}

impl Body {
    /// Append `[tag][raw]` to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_u8(self.origin.kind.tag());
        out.put_slice(&self.origin.raw);
    }

    /// Parse `[tag][raw]`. An empty slice is a payload of unknown type.
    pub fn parse(bytes: Bytes) -> Result<Self> {
        let Some(&tag) = bytes.first() else {
            return Ok(Self {
                payload: Payload::Null,
                origin: Origin {
                    raw: Bytes::new(),
                    kind: DataKind::Unknown(0xff),
                },
            });
        };
        let kind = DataKind::from_tag(tag);
        let raw = bytes.slice(1..);
        let payload = Payload::decode_value(kind, &raw)?;
        Ok(Self {
            payload,
            origin: Origin { raw, kind },
        })
    }
}

impl From<Payload> for Body {
    fn from(payload: Payload) -> Self {
        let origin = Origin {
            raw: payload.encode_value(),
            kind: payload.kind(),
        };
        Self { payload, origin }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Self::Null
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(b))
    }
}

impl From<&[u8]> for Payload {
    fn from(b: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(b))
    }
}

macro_rules! payload_from_number {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Payload {
            fn from(n: $ty) -> Self {
                Self::Number(n as f64)
            }
        })*
    };
}

payload_from_number!(f64, f32, i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Null),
            Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
