//! Mesh error types.

use std::time::Duration;

/// Errors that can occur in the hive_mesh crate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The authentication handshake was rejected or timed out.
    #[error("Auth error: {0}")]
    Auth(String),

    /// The remote sent bytes that do not follow the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote answered with an error (routing failure or handler rejection).
    #[error("{0}")]
    Remote(String),

    /// A request or handshake did not complete in time.
    #[error("Request timeout exceeded ({0:?})")]
    Timeout(Duration),

    /// Every socket of the unit closed while the operation was pending.
    #[error("All unit's sockets have been closed")]
    SocketsClosed,

    /// No connected unit advertises the destination's role.
    #[error("No connected units with role [{0}]")]
    NoUnits(String),

    /// A responder was invoked a second time.
    #[error("Already responded")]
    AlreadyResponded,

    /// A flow-controlled stream failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// Invalid configuration or options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// `listen` was called on a peer that already listens.
    #[error("Peer is already listening")]
    AlreadyListening,

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, MeshError>;
