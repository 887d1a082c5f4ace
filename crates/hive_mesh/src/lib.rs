//! Hive Mesh: peer-to-peer messaging between processes.
//!
//! Peers authenticate each other over WebSocket connections, advertise named
//! services ("roles") and call the roles of other peers with one-way
//! messages, request/response calls, broadcasts, surveys and flow-controlled
//! byte streams.
//!
//! # Architecture
//!
//! - **Protocol**: a compact binary frame format with typed payloads and
//!   numeric correlation ids ([`protocol`]).
//! - **Auth**: mutual HMAC-SHA256 challenge/response over preshared keys,
//!   run on every new socket before it belongs to a unit ([`auth`]).
//! - **Units**: one [`Unit`] per authenticated remote peer, owning its
//!   sockets, pending requests and open streams.
//! - **Roles**: local services with per-event handlers and onion-style
//!   middleware layers ([`Role`], [`middleware`]).
//! - **Destinations**: round-robin gateways to the units serving a remote
//!   role ([`Destination`]).
//! - **Streams**: credit-based byte streams multiplexed on a unit's socket
//!   ([`StreamReader`], [`StreamWriter`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_mesh::{ConnectOptions, Context, MeshConfig, Peer};
//!
//! # async fn example() -> hive_mesh::Result<()> {
//! let server = Peer::new(MeshConfig::named("server"))?;
//! server
//!     .role("echo")
//!     .on_request("echo", |ctx: Context| async move { ctx.reply(ctx.data()) });
//! let addr = server.listen(0u16).await?;
//!
//! let client = Peer::new(MeshConfig::named("client"))?;
//! let echo = client.destination("echo");
//! client.connect(&addr.to_string(), ConnectOptions::default()).await?;
//! echo.wait_ready(std::time::Duration::from_secs(5)).await?;
//!
//! let response = echo.request("echo", "hello").await?;
//! assert_eq!(response.data.as_str(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod destination;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod middleware;
pub mod peer;
pub mod protocol;
pub mod role;
pub mod round_robin;
pub mod stream;
pub mod transport;
pub mod unit;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::{ConnectOptions, ListenOptions, MeshConfig, PresharedKey, TlsConfig};
pub use context::{Communication, Context, Response, StreamReady};
pub use destination::{Destination, EmitOptions};
pub use error::{MeshError, Result};
pub use events::{DestinationEvent, PeerEvent};
pub use identity::{PeerId, PeerMeta};
pub use middleware::Next;
pub use peer::Peer;
pub use protocol::{Origin, Payload};
pub use role::Role;
pub use round_robin::RoundRobinSet;
pub use stream::{StreamReader, StreamWriter};
pub use unit::Unit;
