//! Peer identity and the identity payload exchanged during the handshake.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::protocol::PROTOCOL_VERSION;

/// A unique identifier for a peer process, shared by all its connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (16 random bytes, hex encoded).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process metadata advertised when a connection is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerMeta {
    pub os: String,
    pub runtime: String,
    /// Wall-clock time of the confirmation, milliseconds since the epoch.
    pub time: i64,
    /// Seconds since the process started.
    pub uptime: f64,
    pub protocol: String,
}

impl Default for PeerMeta {
    fn default() -> Self {
        Self {
            os: String::new(),
            runtime: String::new(),
            time: 0,
            uptime: 0.0,
            protocol: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl PeerMeta {
    /// Metadata describing the current process.
    pub fn current() -> Self {
        static STARTED: OnceLock<Instant> = OnceLock::new();
        let started = STARTED.get_or_init(Instant::now);
        Self {
            os: std::env::consts::OS.to_string(),
            runtime: format!(
                "{} {} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                std::env::consts::ARCH
            ),
            time: chrono::Utc::now().timestamp_millis(),
            uptime: started.elapsed().as_secs_f64(),
            protocol: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Whether the remote speaks a protocol with the same major version.
    pub fn is_protocol_compatible(&self) -> bool {
        major(&self.protocol) == major(PROTOCOL_VERSION)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or_default()
}

/// Everything a peer tells the other side once it confirmed the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityPayload {
    pub id: PeerId,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub friendly: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub meta: PeerMeta,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_generation() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_peer_id_from_string() {
        let id = PeerId::from_string("test-peer-123");
        assert_eq!(id.as_str(), "test-peer-123");
        assert_eq!(format!("{id}"), "test-peer-123");
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::from_string("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }

    #[test]
    fn test_current_meta() {
        let meta = PeerMeta::current();
        assert_eq!(meta.protocol, PROTOCOL_VERSION);
        assert!(meta.time > 0);
        assert!(meta.uptime >= 0.0);
        assert!(meta.is_protocol_compatible());
    }

    #[test]
    fn test_protocol_compatibility_by_major() {
        let mut meta = PeerMeta::current();
        meta.protocol = "2.7.1".into();
        assert!(meta.is_protocol_compatible());
        meta.protocol = "1.0.0".into();
        assert!(!meta.is_protocol_compatible());
    }

    #[test]
    fn test_identity_payload_accepts_minimal_json() {
        let payload: IdentityPayload = serde_json::from_str(
            r#"{"id":"f00","roles":["a"],"friendly":true,"name":"x","meta":{"os":"linux","runtime":"nodejs v18","time":1,"uptime":2.5,"protocol":"2.0.0"}}"#,
        )
        .unwrap();
        assert_eq!(payload.id.as_str(), "f00");
        assert_eq!(payload.roles, vec!["a".to_string()]);
        assert!(payload.tags.is_empty());
        assert_eq!(payload.meta.uptime, 2.5);
    }
}
