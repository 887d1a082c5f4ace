//! Peer: the top-level coordinator of the mesh.
//!
//! [`Peer`] is the primary public API of hive_mesh. It owns:
//! - the listener accepting incoming sockets
//! - outbound connections, with a reconnection loop for permanent ones
//! - the table of authenticated [`Unit`]s
//! - the local [`Role`]s and the outbound [`Destination`]s
//! - service discovery through acquaint hints

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::auth::{self, Keyring};
use crate::config::{ConnectOptions, ListenOptions, MeshConfig};
use crate::context::{Communication, Context};
use crate::destination::Destination;
use crate::error::{MeshError, Result};
use crate::events::PeerEvent;
use crate::identity::{IdentityPayload, PeerId, PeerMeta};
use crate::middleware::{self, Layer, LayerSet, Next};
use crate::protocol::{AcquaintMessage, Frame, RolesUpdate, close_code};
use crate::role::Role;
use crate::transport::{self, Connection, Listener, Socket};
use crate::unit::{Unit, UnitSettings};

/// A local participant of the mesh.
///
/// Cheap to clone; all clones share the same state. Background tasks only
/// hold weak references, so dropping the last clone stops the listener and
/// every reconnection loop.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

pub(crate) struct PeerInner {
    id: PeerId,
    config: MeshConfig,
    keyring: Keyring,
    tags: RwLock<BTreeMap<String, String>>,
    units: RwLock<HashMap<PeerId, Arc<Unit>>>,
    roles: RwLock<BTreeMap<String, Arc<Role>>>,
    destinations: RwLock<BTreeMap<String, Arc<Destination>>>,
    /// Permanent addresses and the unit currently connected through each.
    addresses: Mutex<HashMap<String, Option<PeerId>>>,
    layers: RwLock<LayerSet>,
    roles_seq: Mutex<u64>,
    roles_flush_pending: AtomicBool,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: broadcast::Sender<()>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("name", &self.inner.config.name)
            .field("units", &self.inner.units.read().len())
            .finish()
    }
}

impl Peer {
    /// Create a peer with a fresh random id.
    pub fn new(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(4);
        let inner = PeerInner {
            id: PeerId::generate(),
            keyring: Keyring::new(config.preshared_keys.iter().cloned()),
            tags: RwLock::new(config.tags.clone()),
            config,
            units: RwLock::new(HashMap::new()),
            roles: RwLock::new(BTreeMap::new()),
            destinations: RwLock::new(BTreeMap::new()),
            addresses: Mutex::new(HashMap::new()),
            layers: RwLock::new(LayerSet::default()),
            roles_seq: Mutex::new(0),
            roles_flush_pending: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            events,
            shutdown,
        };
        info!(
            "Peer '{}' created (id: {})",
            inner.config.name, inner.id
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn is_friendly(&self) -> bool {
        self.inner.config.friendly
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    /// Add a preshared key; a key with the same id is replaced. Only
    /// handshakes started afterwards use it.
    pub fn add_preshared_key(&self, id: impl Into<String>, key: impl Into<String>) {
        self.inner.keyring.insert(id, key);
    }

    /// Set a static tag. Units connected before the change keep the old tags.
    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.tags.write().insert(key.into(), value.into());
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.tags.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    // -- Connections --------------------------------------------------------

    /// Start accepting connections. Returns the bound address; a second call
    /// fails with [`MeshError::AlreadyListening`].
    pub async fn listen(&self, options: impl Into<ListenOptions>) -> Result<SocketAddr> {
        let options = options.into();
        if self.inner.listening.swap(true, Ordering::SeqCst) {
            return Err(MeshError::AlreadyListening);
        }
        let listener = match Listener::bind(&options).await {
            Ok(listener) => listener,
            Err(e) => {
                self.inner.listening.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);

        let (conn_tx, mut conn_rx) = mpsc::channel::<Connection>(64);
        tokio::spawn(listener.serve(conn_tx, self.inner.shutdown.subscribe()));

        let peer = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(conn) = conn_rx.recv().await {
                let Some(peer) = peer.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = peer.accept(conn).await;
                });
            }
        });

        info!("Peer '{}' listening on {addr}", self.inner.config.name);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Authenticate a WebSocket upgraded by an outside HTTP server.
    pub async fn accept_upgraded<S>(&self, ws: WebSocketStream<S>) -> Result<Arc<Unit>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.accept(transport::attach(ws, None)).await
    }

    /// Connect to a remote peer. A permanent connection is retried until the
    /// resulting unit is closed explicitly; the call itself reports the first
    /// attempt.
    pub async fn connect(&self, address: &str, options: ConnectOptions) -> Result<Arc<Unit>> {
        self.inner.connect(address, options).await
    }

    /// Stop listening, close every unit and end all reconnection loops.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.addresses.lock().clear();
        let _ = inner.shutdown.send(());
        inner.listening.store(false, Ordering::SeqCst);
        *inner.local_addr.lock() = None;
        for unit in self.units() {
            unit.close();
        }
        info!("Peer '{}' closed", inner.config.name);
    }

    // -- Tables -------------------------------------------------------------

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.inner.units.read().values().cloned().collect()
    }

    pub fn unit(&self, id: &PeerId) -> Option<Arc<Unit>> {
        self.inner.connected_unit(id)
    }

    pub fn roles(&self) -> Vec<Arc<Role>> {
        self.inner.roles.read().values().cloned().collect()
    }

    pub fn destinations(&self) -> Vec<Arc<Destination>> {
        self.inner.destinations.read().values().cloned().collect()
    }

    /// The gateway to the remote role `name`, created on first use.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn destination(&self, name: &str) -> Arc<Destination> {
        assert!(!name.is_empty(), "destination name must not be empty");
        if let Some(existing) = self.inner.destinations.read().get(name) {
            return Arc::clone(existing);
        }
        let destination = {
            let mut destinations = self.inner.destinations.write();
            if let Some(existing) = destinations.get(name) {
                return Arc::clone(existing);
            }
            let destination = Arc::new(Destination::new(
                name.to_string(),
                Arc::downgrade(&self.inner),
            ));
            destinations.insert(name.to_string(), Arc::clone(&destination));
            destination
        };
        {
            // Eviction takes the write lock, so a unit seen here is either
            // still connected or will be removed from this destination too.
            let units = self.inner.units.read();
            for unit in units.values() {
                if unit.has_role(name) && !unit.is_closed() {
                    destination.add_unit(unit);
                }
            }
        }
        debug!("Destination \"{name}\" declared");
        destination
    }

    /// The local role `name`, created active on first use.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn role(&self, name: &str) -> Arc<Role> {
        self.role_with_status(name, true)
    }

    /// Like [`role`](Self::role); `active` only applies when the role is
    /// created by this call.
    ///
    /// # Panics
    ///
    /// Panics if `name` is empty.
    pub fn role_with_status(&self, name: &str, active: bool) -> Arc<Role> {
        assert!(!name.is_empty(), "role name must not be empty");
        let role = {
            let mut roles = self.inner.roles.write();
            if let Some(existing) = roles.get(name) {
                return Arc::clone(existing);
            }
            let role = Arc::new(Role::new(
                name.to_string(),
                active,
                Arc::downgrade(&self.inner),
            ));
            roles.insert(name.to_string(), Arc::clone(&role));
            role
        };
        info!("Role \"{name}\" registered");
        self.inner.emit(PeerEvent::RoleRegistered(name.to_string()));
        self.inner.roles_changed();
        role
    }

    // -- Peer-wide layers ---------------------------------------------------

    /// Layer run for every incoming call to any role.
    pub fn on_data<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(None, middleware::layer(f));
    }

    pub fn on_message<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Message), middleware::layer(f));
    }

    pub fn on_request<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Request), middleware::layer(f));
    }

    pub fn on_readable<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Readable), middleware::layer(f));
    }

    pub fn on_writable<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Writable), middleware::layer(f));
    }

    fn add_layer(&self, kind: Option<Communication>, layer: Layer) {
        self.inner.layers.write().push(kind, layer);
    }
}

impl PeerInner {
    pub(crate) fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn identity(&self) -> IdentityPayload {
        IdentityPayload {
            id: self.id.clone(),
            roles: self.active_roles(),
            friendly: self.config.friendly,
            name: self.config.name.clone(),
            meta: PeerMeta::current(),
            tags: self.tags.read().clone(),
        }
    }

    fn active_roles(&self) -> Vec<String> {
        self.roles
            .read()
            .values()
            .filter(|role| role.active())
            .map(|role| role.name().to_string())
            .collect()
    }

    fn settings(&self) -> UnitSettings {
        UnitSettings {
            request_timeout: self.config.request_timeout,
            high_water_mark: self.config.stream_high_water_mark,
        }
    }

    pub(crate) fn role_named(&self, name: &str) -> Option<Arc<Role>> {
        self.roles.read().get(name).cloned()
    }

    pub(crate) fn layers(&self, kind: Communication) -> Vec<Layer> {
        self.layers.read().chain(kind)
    }

    pub(crate) fn connected_unit(&self, id: &PeerId) -> Option<Arc<Unit>> {
        self.units.read().get(id).cloned()
    }

    // -- Admission ----------------------------------------------------------

    /// Run the handshake on an incoming socket.
    async fn accept(self: &Arc<Self>, conn: Connection) -> Result<Arc<Unit>> {
        let peer_addr = conn.socket.peer_addr();
        match self.admit(conn, None).await {
            Ok(unit) => Ok(unit),
            Err(e) => {
                warn!("Incoming connection from {peer_addr:?} failed: {e}");
                self.emit(PeerEvent::AuthError(e.to_string()));
                Err(e)
            }
        }
    }

    async fn admit(self: &Arc<Self>, conn: Connection, address: Option<String>) -> Result<Arc<Unit>> {
        let Connection {
            socket,
            mut inbound,
        } = conn;
        let remote = match auth::authenticate(
            &socket,
            &mut inbound,
            self.keyring.snapshot(),
            self.identity(),
            self.config.auth_timeout,
        )
        .await
        {
            Ok(remote) => remote,
            Err(e) => {
                socket.close(close_code::AUTH_REJECTED, "AUTH REJECTED");
                return Err(e);
            }
        };
        if !remote.meta.is_protocol_compatible() {
            warn!(
                "Unit {} speaks protocol {} (ours {})",
                remote.id,
                remote.meta.protocol,
                crate::protocol::PROTOCOL_VERSION
            );
        }
        Ok(self.bind_unit(socket, inbound, remote, address))
    }

    /// Attach an authenticated socket to the unit of its remote id, creating
    /// the unit on its first socket.
    fn bind_unit(
        self: &Arc<Self>,
        socket: Arc<Socket>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        remote: IdentityPayload,
        address: Option<String>,
    ) -> Arc<Unit> {
        let (unit, fresh) = {
            let mut units = self.units.write();
            let (unit, fresh) = match units.get(&remote.id) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let id = remote.id.clone();
                    let unit = Arc::new(Unit::new(
                        remote,
                        address.clone(),
                        Arc::downgrade(self),
                        self.settings(),
                    ));
                    units.insert(id, Arc::clone(&unit));
                    (unit, true)
                }
            };
            unit.attach_socket(Arc::clone(&socket));
            (unit, fresh)
        };
        if let Some(address) = address.filter(|_| unit.address().is_none()) {
            unit.set_address(address);
        }

        tokio::spawn(transport::heartbeat(
            Arc::clone(&socket),
            self.config.heartbeat_interval,
            self.config.heartbeat_timeout,
        ));
        tokio::spawn(pump(
            Arc::downgrade(self),
            Arc::clone(&unit),
            socket,
            inbound,
        ));

        self.refresh_destinations(&unit);
        self.introduce(&unit);
        if fresh {
            info!(
                "Unit '{}' connected (id: {}, roles: {:?})",
                unit.name(),
                unit.id(),
                unit.roles()
            );
            self.emit(PeerEvent::UnitConnected(Arc::clone(&unit)));
        } else {
            debug!(
                "Unit {} gained a socket ({} total)",
                unit.id(),
                unit.socket_count()
            );
        }
        unit
    }

    /// Forget a closed socket; evict the unit once it has none left.
    fn socket_closed(&self, unit: &Arc<Unit>, socket_id: u64) {
        let evicted = {
            let mut units = self.units.write();
            let empty = unit.detach_socket(socket_id);
            if empty
                && units
                    .get(unit.id())
                    .is_some_and(|current| Arc::ptr_eq(current, unit))
            {
                units.remove(unit.id());
            }
            empty
        };
        if !evicted {
            return;
        }
        info!("Unit '{}' closed (id: {})", unit.name(), unit.id());
        unit.shutdown(|| MeshError::SocketsClosed);
        for destination in self.destinations.read().values() {
            destination.remove_unit(unit);
        }
        self.emit(PeerEvent::UnitClosed(unit.id().clone()));
    }

    pub(crate) fn unit_error(&self, unit: &Unit, error: &str) {
        self.emit(PeerEvent::UnitError {
            unit: unit.id().clone(),
            error: error.to_string(),
        });
    }

    // -- Outbound -----------------------------------------------------------

    async fn connect(self: &Arc<Self>, address: &str, options: ConnectOptions) -> Result<Arc<Unit>> {
        let address = transport::normalize_address(address);
        if !options.permanent {
            let (unit, _) = self.dial(&address, options).await?;
            return Ok(unit);
        }
        self.addresses.lock().insert(address.clone(), None);
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            address,
            options,
            first_tx,
        ));
        first_rx
            .await
            .map_err(|_| MeshError::Transport("connection loop stopped".into()))?
    }

    async fn dial(
        self: &Arc<Self>,
        address: &str,
        options: ConnectOptions,
    ) -> Result<(Arc<Unit>, Arc<Socket>)> {
        let conn = transport::dial(
            address,
            options.accept_invalid_certs,
            self.config.connect_timeout,
        )
        .await?;
        let socket = Arc::clone(&conn.socket);
        let unit = self.admit(conn, Some(address.to_string())).await?;
        Ok((unit, socket))
    }

    pub(crate) fn forget_addresses_of(&self, unit: &Unit) {
        let mut addresses = self.addresses.lock();
        addresses.retain(|address, current| {
            let keep = current.as_ref() != Some(unit.id());
            if !keep {
                debug!("Address {address} will not be reconnected");
            }
            keep
        });
    }

    // -- Roles & destinations -----------------------------------------------

    /// Schedule one ROLES broadcast for every change made before the
    /// scheduler gets to run it.
    pub(crate) fn roles_changed(self: &Arc<Self>) {
        if self.roles_flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Nothing can be connected without a runtime.
            self.roles_flush_pending.store(false, Ordering::SeqCst);
            return;
        };
        let peer = Arc::downgrade(self);
        runtime.spawn(async move {
            tokio::task::yield_now().await;
            if let Some(peer) = peer.upgrade() {
                peer.flush_roles();
            }
        });
    }

    fn flush_roles(&self) {
        self.roles_flush_pending.store(false, Ordering::SeqCst);
        let (roles, frame) = {
            let mut seq = self.roles_seq.lock();
            *seq += 1;
            let roles = self.active_roles();
            let frame = Frame::Roles(RolesUpdate {
                i: *seq,
                roles: roles.clone(),
            })
            .encode();
            (roles, frame)
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Roles update not encodable: {e}");
                return;
            }
        };
        let units: Vec<_> = self.units.read().values().cloned().collect();
        debug!("Announcing roles {roles:?} to {} units", units.len());
        // Out-of-order arrivals are dropped by the sequence check.
        for unit in units {
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Err(e) = unit.send_frame(frame).await {
                    debug!("Roles update to unit {} not sent: {e}", unit.id());
                }
            });
        }
        self.emit(PeerEvent::RolesChanged(roles));
    }

    /// Put the unit into the destinations it serves and out of the others.
    pub(crate) fn refresh_destinations(&self, unit: &Arc<Unit>) {
        if unit.is_closed() {
            return;
        }
        for (name, destination) in self.destinations.read().iter() {
            if unit.has_role(name) {
                destination.add_unit(unit);
                // Closed between the check above and the add.
                if unit.is_closed() {
                    destination.remove_unit(unit);
                }
            } else {
                destination.remove_unit(unit);
            }
        }
    }

    // -- Service discovery --------------------------------------------------

    /// Tell friendly units about a new one and the new one about the peers
    /// we dialed.
    fn introduce(&self, unit: &Arc<Unit>) {
        if !unit.is_friendly() {
            return;
        }
        let roles = unit.roles();
        let units: Vec<_> = self.units.read().values().cloned().collect();

        let address = unit.address().filter(|_| roles.len() > 1);
        if let Some(address) = address {
            let hint = AcquaintMessage {
                id: unit.id().clone(),
                address: Some(address),
                roles,
            };
            for other in units.iter().filter(|u| u.id() != unit.id() && u.is_friendly()) {
                send_hint(other, hint.clone());
            }
        }

        let known: Vec<(String, PeerId)> = self
            .addresses
            .lock()
            .iter()
            .filter_map(|(address, id)| Some((address.clone(), id.clone()?)))
            .collect();
        for (address, id) in known {
            if &id == unit.id() {
                continue;
            }
            if let Some(other) = units.iter().find(|u| u.id() == &id) {
                send_hint(
                    unit,
                    AcquaintMessage {
                        id,
                        address: Some(address),
                        roles: other.roles(),
                    },
                );
            }
        }
    }

    /// Dial a hinted peer if it serves one of our destinations.
    pub(crate) fn handle_acquaint(self: &Arc<Self>, hint: AcquaintMessage) {
        if !self.config.friendly {
            return;
        }
        if hint.id == self.id || self.units.read().contains_key(&hint.id) {
            return;
        }
        let Some(address) = hint.address.as_deref().map(transport::normalize_address) else {
            debug!("Acquaint hint for {} carries no address", hint.id);
            return;
        };
        if self.addresses.lock().contains_key(&address) {
            return;
        }
        let wanted = {
            let destinations = self.destinations.read();
            hint.roles.iter().any(|role| destinations.contains_key(role))
        };
        if !wanted {
            return;
        }
        info!("Acquainted with {} at {address}, connecting", hint.id);
        let peer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = peer.connect(&address, ConnectOptions::default()).await {
                warn!("Connecting to acquainted peer at {address} failed: {e}");
            }
        });
    }
}

fn send_hint(unit: &Arc<Unit>, hint: AcquaintMessage) {
    let frame = match Frame::Acquaint(hint).encode() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Acquaint hint not encodable: {e}");
            return;
        }
    };
    let unit = Arc::clone(unit);
    tokio::spawn(async move {
        if let Err(e) = unit.send_frame(frame).await {
            debug!("Acquaint hint to unit {} not sent: {e}", unit.id());
        }
    });
}

/// Feed every frame of one socket to its unit, then report the close.
async fn pump(
    peer: Weak<PeerInner>,
    unit: Arc<Unit>,
    socket: Arc<Socket>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(bytes) = inbound.recv().await {
        unit.handle_payload(&socket, bytes);
    }
    let code = socket.closed().await;
    debug!(
        "Socket {} of unit {} closed (code {code:?})",
        socket.id(),
        unit.id()
    );
    match peer.upgrade() {
        Some(peer) => peer.socket_closed(&unit, socket.id()),
        None => {
            if unit.detach_socket(socket.id()) {
                unit.shutdown(|| MeshError::SocketsClosed);
            }
        }
    }
}

/// Keep a permanent address connected until it leaves the address table.
/// The outcome of the first attempt is reported through `first`.
async fn reconnect_loop(
    peer: Weak<PeerInner>,
    address: String,
    options: ConnectOptions,
    first: oneshot::Sender<Result<Arc<Unit>>>,
) {
    let mut first = Some(first);
    let mut attempt = 0usize;
    loop {
        let Some(inner) = peer.upgrade() else {
            return;
        };
        if !inner.addresses.lock().contains_key(&address) {
            debug!("Stopped reconnecting to {address}");
            return;
        }

        match inner.dial(&address, options).await {
            Ok((unit, socket)) => {
                if let Some(entry) = inner.addresses.lock().get_mut(&address) {
                    *entry = Some(unit.id().clone());
                }
                if attempt > 0 {
                    info!("Reconnected to {address} after {attempt} attempts");
                    inner.emit(PeerEvent::ReconnectSuccess {
                        address: address.clone(),
                        attempt,
                    });
                }
                if let Some(tx) = first.take() {
                    let _ = tx.send(Ok(unit));
                }
                drop(inner);

                let _ = socket.closed().await;
                let Some(inner) = peer.upgrade() else {
                    return;
                };
                if let Some(entry) = inner.addresses.lock().get_mut(&address) {
                    *entry = None;
                    info!("Connection to {address} lost, reconnecting");
                }
                attempt = 0;
            }
            Err(e) => {
                if attempt > 0 {
                    warn!("Reconnect attempt {attempt} to {address} failed: {e}");
                    inner.emit(PeerEvent::ReconnectFail {
                        address: address.clone(),
                        attempt,
                        error: e.to_string(),
                    });
                }
                let delay = inner.config.reconnect_delay(attempt);
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(e));
                }
                drop(inner);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
