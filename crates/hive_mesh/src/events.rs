//! Lifecycle notifications of peers and destinations.

use std::sync::Arc;

use crate::identity::PeerId;
use crate::unit::Unit;

/// Something that happened to the local peer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A unit completed its first handshake.
    UnitConnected(Arc<Unit>),
    /// A unit lost its last socket.
    UnitClosed(PeerId),
    /// A unit broke the protocol and was closed.
    UnitError { unit: PeerId, error: String },
    /// A role was created with [`Peer::role`](crate::Peer::role).
    RoleRegistered(String),
    /// The set of active roles was announced to the connected units.
    RolesChanged(Vec<String>),
    /// An incoming connection failed the handshake.
    AuthError(String),
    /// A permanent connection came back after `attempt` failed or lost tries.
    ReconnectSuccess { address: String, attempt: usize },
    /// A reconnection attempt failed; the next one follows the schedule.
    ReconnectFail {
        address: String,
        attempt: usize,
        error: String,
    },
}

/// Something that happened to a destination.
#[derive(Debug, Clone)]
pub enum DestinationEvent {
    /// The first unit serving the role appeared.
    Ready,
    UnitAdded(Arc<Unit>),
    UnitRemoved(PeerId),
    /// The last unit serving the role went away.
    Empty,
}
