//! Binary wire protocol shared by every connection.
//!
//! Every frame exchanged after the handshake starts with a one-byte type
//! tag (see [`tag`]) followed by explicit-length fields and, for most
//! frames, a typed [`Payload`]. Multi-byte integers are big-endian; ids are
//! written as the minimal number of base-256 digits with a one-byte length
//! prefix.

pub mod frame;
pub mod payload;

pub use frame::{AcquaintMessage, Frame, RolesUpdate, StreamDirection, StreamFlag};
pub use payload::{Body, DataKind, Origin, Payload};

use crate::error::{MeshError, Result};

/// Version advertised in the identity payload.
pub const PROTOCOL_VERSION: &str = "2.0.0";

/// Frame type tags.
pub mod tag {
    pub const MESSAGE: u8 = 100;
    pub const REQUEST: u8 = 101;
    pub const RESPONSE: u8 = 102;
    pub const REQUEST_READABLE: u8 = 103;
    pub const REQUEST_WRITABLE: u8 = 104;
    pub const REJECT: u8 = 105;
    pub const STREAM_MESSAGE: u8 = 106;
    pub const STREAM_RESOLVE: u8 = 107;
    pub const STREAM_REJECT: u8 = 108;
    pub const ACQUAINT: u8 = 200;
    pub const ROLES: u8 = 201;
}

/// Close codes used by the mesh, outside the range reserved by WebSocket.
pub mod close_code {
    /// The unit was closed on purpose; do not reconnect from this side.
    pub const MANUAL: u16 = 4000;
    pub const HEARTBEAT_TIMEOUT: u16 = 4001;
    pub const AUTH_REJECTED: u16 = 4002;
    /// Standard WebSocket code for a peer that broke the protocol.
    pub const PROTOCOL_ERROR: u16 = 1002;
}

/// Encode `n` as the minimal big-endian base-256 digits (`0` is one byte).
pub fn encode_number(n: u64) -> Vec<u8> {
    let bytes = n.to_be_bytes();
    let first = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}

/// Inverse of [`encode_number`]. An empty slice decodes to zero.
pub fn decode_number(bytes: &[u8]) -> Result<u64> {
    if bytes.len() > 8 {
        return Err(MeshError::Protocol(format!(
            "numeric field of {} bytes does not fit in 64 bits",
            bytes.len()
        )));
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
