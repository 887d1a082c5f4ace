//! Remote peers as seen from the local peer.
//!
//! A [`Unit`] owns every authenticated socket to one remote peer id, the
//! table of requests waiting for an answer and the bus of open streams.
//! Incoming frames from any of its sockets are dispatched here.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::context::{Communication, Context, Response, StreamReady};
use crate::error::{MeshError, Result};
use crate::identity::{IdentityPayload, PeerId, PeerMeta};
use crate::middleware;
use crate::peer::PeerInner;
use crate::protocol::{Body, Frame, Payload, RolesUpdate, StreamDirection, close_code};
use crate::stream::{StreamBus, StreamReader, StreamWriter};
use crate::transport::Socket;

/// Correlation ids wrap below this bound.
const CORRELATION_LIMIT: u64 = 1 << 24;

/// Per-unit settings taken from the peer configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitSettings {
    pub request_timeout: Duration,
    pub high_water_mark: usize,
}

/// The answer to a request or a stream request.
pub(crate) enum Reply {
    Resolved { control: u64, body: Body },
    Rejected(String),
}

#[derive(Default)]
struct Correlations {
    last: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Reply>>>,
}

impl Correlations {
    fn allocate(&mut self) -> u64 {
        loop {
            self.last = if self.last + 1 >= CORRELATION_LIMIT {
                1
            } else {
                self.last + 1
            };
            if !self.pending.contains_key(&self.last) {
                return self.last;
            }
        }
    }
}

/// One authenticated remote peer.
pub struct Unit {
    id: PeerId,
    name: String,
    friendly: bool,
    meta: PeerMeta,
    tags: BTreeMap<String, String>,
    address: RwLock<Option<String>>,
    peer: Weak<PeerInner>,
    settings: UnitSettings,
    roles: RwLock<Vec<String>>,
    last_roles_update: Mutex<u64>,
    sockets: RwLock<Vec<Arc<Socket>>>,
    correlations: Mutex<Correlations>,
    streams: Arc<StreamBus>,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("roles", &*self.roles.read())
            .field("sockets", &self.sockets.read().len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Unit {}

impl std::hash::Hash for Unit {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Unit {
    pub(crate) fn new(
        identity: IdentityPayload,
        address: Option<String>,
        peer: Weak<PeerInner>,
        settings: UnitSettings,
    ) -> Self {
        Self {
            id: identity.id,
            name: identity.name,
            friendly: identity.friendly,
            meta: identity.meta,
            tags: identity.tags,
            address: RwLock::new(address),
            peer,
            settings,
            roles: RwLock::new(identity.roles),
            last_roles_update: Mutex::new(0),
            sockets: RwLock::new(Vec::new()),
            correlations: Mutex::new(Correlations::default()),
            streams: Arc::new(StreamBus::default()),
            closed: watch::Sender::new(false),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the remote takes part in service discovery.
    pub fn is_friendly(&self) -> bool {
        self.friendly
    }

    pub fn meta(&self) -> &PeerMeta {
        &self.meta
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The roles the remote currently advertises as active.
    pub fn roles(&self) -> Vec<String> {
        self.roles.read().clone()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.read().iter().any(|r| r == role)
    }

    /// The address we dialed to reach this unit, if we dialed it.
    pub fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the unit has lost its last socket.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close every socket on purpose. A permanent connection to this unit
    /// is not retried from this side.
    pub fn close(&self) {
        if let Some(peer) = self.peer.upgrade() {
            peer.forget_addresses_of(self);
        }
        let sockets = self.sockets.read().clone();
        info!("Closing unit {} ({} sockets)", self.id, sockets.len());
        for socket in sockets {
            socket.close(close_code::MANUAL, "Unit closed");
        }
    }

    // -- Sockets ------------------------------------------------------------

    pub(crate) fn attach_socket(&self, socket: Arc<Socket>) {
        self.sockets.write().push(socket);
    }

    pub(crate) fn set_address(&self, address: String) {
        *self.address.write() = Some(address);
    }

    /// Forget a closed socket and fail the streams bound to it. Returns
    /// whether the unit is left without sockets.
    pub(crate) fn detach_socket(&self, socket_id: u64) -> bool {
        let empty = {
            let mut sockets = self.sockets.write();
            sockets.retain(|s| s.id() != socket_id);
            sockets.is_empty()
        };
        self.streams.socket_closed(socket_id);
        empty
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.read().len()
    }

    fn pick_socket(&self) -> Option<Arc<Socket>> {
        self.sockets.read().iter().find(|s| s.is_open()).cloned()
    }

    /// Send on the first open socket, failing over to the next ones.
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<()> {
        let sockets: Vec<_> = self
            .sockets
            .read()
            .iter()
            .filter(|s| s.is_open())
            .cloned()
            .collect();
        let mut last_error = MeshError::SocketsClosed;
        for socket in sockets {
            match socket.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Send via socket {} of unit {} failed: {e}", socket.id(), self.id);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Mark the unit closed and fail everything still pending on it.
    pub(crate) fn shutdown(&self, reason: impl Fn() -> MeshError) {
        let pending: Vec<_> = self.correlations.lock().pending.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(reason()));
        }
        self.streams.close_all(&reason().to_string());
        self.closed.send_replace(true);
    }

    // -- Outgoing -----------------------------------------------------------

    pub(crate) async fn send_message(&self, role: &str, event: &str, data: Payload) -> Result<()> {
        let frame = Frame::Message {
            role: role.to_string(),
            event: event.to_string(),
            body: data.into(),
        }
        .encode()?;
        self.send_frame(frame).await
    }

    pub(crate) async fn request(
        self: &Arc<Self>,
        role: &str,
        event: &str,
        data: Payload,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let (correlation, rx) = self.register();
        let armed = Instant::now();
        let sent = match (Frame::Request {
            role: role.to_string(),
            event: event.to_string(),
            correlation,
            body: data.into(),
        })
        .encode()
        {
            Ok(frame) => self.send_frame(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.forget(correlation);
            return Err(e);
        }

        match self.await_reply(correlation, rx, timeout).await? {
            Reply::Resolved { body, .. } => Ok(Response {
                data: body.payload,
                origin: body.origin,
                unit: Arc::clone(self),
                rtt: armed.elapsed(),
            }),
            Reply::Rejected(message) => Err(MeshError::Remote(message)),
        }
    }

    /// Ask the remote for a stream we read from.
    pub(crate) async fn open_readable(
        self: &Arc<Self>,
        role: &str,
        event: &str,
        data: Payload,
        timeout: Option<Duration>,
    ) -> Result<StreamReader> {
        let socket = self.pick_socket().ok_or(MeshError::SocketsClosed)?;
        let reader = StreamReader::register(
            &self.streams,
            Arc::clone(&socket),
            None,
            self.settings.high_water_mark,
        )?;
        let reply = self
            .stream_request(
                &socket,
                StreamDirection::Readable,
                role,
                event,
                reader.local_id(),
                data,
                timeout,
            )
            .await?;
        match reply {
            Reply::Resolved { control, body } => {
                reader.bind_remote(control);
                Ok(reader.with_ready(self.ready(body)))
            }
            Reply::Rejected(message) => {
                reader.discard();
                Err(MeshError::Stream(format!(
                    "Unit rejected request for readable stream: {message}"
                )))
            }
        }
    }

    /// Ask the remote for a stream we write into.
    pub(crate) async fn open_writable(
        self: &Arc<Self>,
        role: &str,
        event: &str,
        data: Payload,
        timeout: Option<Duration>,
    ) -> Result<StreamWriter> {
        let socket = self.pick_socket().ok_or(MeshError::SocketsClosed)?;
        let writer = StreamWriter::register(
            &self.streams,
            Arc::clone(&socket),
            None,
            self.settings.high_water_mark,
        )?;
        let reply = self
            .stream_request(
                &socket,
                StreamDirection::Writable,
                role,
                event,
                writer.local_id(),
                data,
                timeout,
            )
            .await?;
        match reply {
            Reply::Resolved { control, body } => {
                writer.bind_remote(control);
                Ok(writer.with_ready(self.ready(body)))
            }
            Reply::Rejected(message) => {
                writer.discard();
                Err(MeshError::Stream(format!(
                    "Unit rejected request for writable stream: {message}"
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_request(
        &self,
        socket: &Socket,
        direction: StreamDirection,
        role: &str,
        event: &str,
        control: u64,
        data: Payload,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let timeout = timeout.unwrap_or(self.settings.request_timeout);
        let (correlation, rx) = self.register();
        let sent = match (Frame::StreamRequest {
            direction,
            role: role.to_string(),
            event: event.to_string(),
            correlation,
            control,
            body: data.into(),
        })
        .encode()
        {
            Ok(frame) => socket.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.forget(correlation);
            return Err(e);
        }
        self.await_reply(correlation, rx, timeout).await
    }

    fn ready(self: &Arc<Self>, body: Body) -> StreamReady {
        StreamReady {
            data: body.payload,
            origin: body.origin,
            unit: Arc::clone(self),
        }
    }

    // -- Correlations -------------------------------------------------------

    fn register(&self) -> (u64, oneshot::Receiver<Result<Reply>>) {
        let (tx, rx) = oneshot::channel();
        let mut correlations = self.correlations.lock();
        let id = correlations.allocate();
        correlations.pending.insert(id, tx);
        (id, rx)
    }

    fn forget(&self, correlation: u64) {
        self.correlations.lock().pending.remove(&correlation);
    }

    /// Resolve a pending correlation; later answers for it are ignored.
    fn settle(&self, correlation: u64, reply: Reply) {
        let tx = self.correlations.lock().pending.remove(&correlation);
        match tx {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
            }
            None => debug!(
                "Unit {} answered unknown or expired correlation {correlation}",
                self.id
            ),
        }
    }

    async fn await_reply(
        &self,
        correlation: u64,
        rx: oneshot::Receiver<Result<Reply>>,
        timeout: Duration,
    ) -> Result<Reply> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(MeshError::SocketsClosed),
            Err(_) => {
                self.forget(correlation);
                Err(MeshError::Timeout(timeout))
            }
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.correlations.lock().pending.len()
    }

    // -- Incoming -----------------------------------------------------------

    /// Dispatch one frame received on `socket`.
    pub(crate) fn handle_payload(self: &Arc<Self>, socket: &Arc<Socket>, bytes: Bytes) {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.protocol_error(format!(
                    "{e}. Make sure unit {} implements the protocol correctly",
                    self.id
                ));
                return;
            }
        };

        match frame {
            Frame::Message { role, event, body } => self.dispatch_message(role, event, body),
            Frame::Request {
                role,
                event,
                correlation,
                body,
            } => self.dispatch_request(role, event, correlation, body),
            Frame::StreamRequest {
                direction,
                role,
                event,
                correlation,
                control,
                body,
            } => self.dispatch_stream(socket, direction, role, event, correlation, control, body),
            Frame::Response { correlation, body } => self.settle(
                correlation,
                Reply::Resolved {
                    control: 0,
                    body,
                },
            ),
            Frame::Reject { correlation, body } => {
                self.settle(correlation, Reply::Rejected(body.payload.to_text()))
            }
            Frame::StreamResolve {
                correlation,
                control,
                body,
            } => self.settle(correlation, Reply::Resolved { control, body }),
            Frame::StreamReject {
                correlation, body, ..
            } => self.settle(correlation, Reply::Rejected(stream_error_text(&body.payload))),
            Frame::StreamMessage {
                stream_id,
                flag,
                body,
            } => {
                self.streams.dispatch(stream_id, flag, body);
            }
            Frame::Acquaint(message) => {
                if let Some(peer) = self.peer.upgrade() {
                    peer.handle_acquaint(message);
                }
            }
            Frame::Roles(update) => self.apply_roles(update),
        }
    }

    fn apply_roles(self: &Arc<Self>, update: RolesUpdate) {
        {
            let mut last = self.last_roles_update.lock();
            if update.i <= *last {
                debug!(
                    "Unit {} sent stale roles update {} (last {})",
                    self.id, update.i, *last
                );
                return;
            }
            *last = update.i;
            *self.roles.write() = update.roles;
        }
        debug!("Unit {} now advertises {:?}", self.id, self.roles.read());
        if let Some(peer) = self.peer.upgrade() {
            peer.refresh_destinations(self);
        }
    }

    /// Resolve the role for an incoming call, or the routing error to send
    /// back.
    fn route(
        &self,
        kind: Communication,
        role: &str,
        event: &str,
    ) -> std::result::Result<(Vec<middleware::Layer>, Vec<middleware::Handler>), String> {
        let peer = self
            .peer
            .upgrade()
            .ok_or_else(|| "The peer is shutting down".to_string())?;
        let local = peer
            .role_named(role)
            .ok_or_else(|| format!("The role \"{role}\" is not registered"))?;
        if !local.active() {
            return Err(format!("The role \"{role}\" is disabled"));
        }
        if kind.expects_answer() && !local.has_handler(kind, event) {
            return Err(format!("The event \"{event}\" is not handled"));
        }
        let mut layers = peer.layers(kind);
        layers.extend(local.layers(kind));
        Ok((layers, local.handlers(kind, event)))
    }

    fn dispatch_message(self: &Arc<Self>, role: String, event: String, body: Body) {
        let (layers, handlers) = match self.route(Communication::Message, &role, &event) {
            Ok(route) => route,
            Err(reason) => {
                debug!("Dropping message \"{event}\" from unit {}: {reason}", self.id);
                return;
            }
        };
        let ctx = Context::new(Communication::Message, Arc::clone(self), role, event, body);
        tokio::spawn(middleware::drive(ctx, layers, handlers));
    }

    fn dispatch_request(self: &Arc<Self>, role: String, event: String, correlation: u64, body: Body) {
        let unit = Arc::clone(self);
        let (layers, handlers) = match self.route(Communication::Request, &role, &event) {
            Ok(route) => route,
            Err(reason) => {
                tokio::spawn(async move {
                    unit.answer(Frame::reject(correlation, &reason)).await;
                });
                return;
            }
        };
        let ctx = Context::new(Communication::Request, Arc::clone(self), role, event, body);
        tokio::spawn(async move {
            middleware::drive(ctx.clone(), layers, handlers).await;
            if !ctx.is_responded() {
                return;
            }
            let frame = match ctx.error() {
                Some(error) => Frame::reject(correlation, &error),
                None => Frame::Response {
                    correlation,
                    body: ctx.response().into(),
                },
            };
            unit.answer(frame).await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_stream(
        self: &Arc<Self>,
        socket: &Arc<Socket>,
        direction: StreamDirection,
        role: String,
        event: String,
        correlation: u64,
        control: u64,
        body: Body,
    ) {
        // The opener reads means the handler writes, and the other way round.
        let kind = match direction {
            StreamDirection::Readable => Communication::Writable,
            StreamDirection::Writable => Communication::Readable,
        };
        let unit = Arc::clone(self);
        let routed = self.route(kind, &role, &event).and_then(|route| {
            if control == 0 {
                Err("Internal error: the stream id must not be zero".to_string())
            } else {
                Ok(route)
            }
        });
        let (layers, handlers) = match routed {
            Ok(route) => route,
            Err(reason) => {
                tokio::spawn(async move {
                    unit.answer(Frame::stream_reject(correlation, &reason)).await;
                });
                return;
            }
        };

        let hwm = self.settings.high_water_mark;
        let ctx = Context::new(kind, Arc::clone(self), role, event, body);
        let (ctx, local) = match kind {
            Communication::Readable => {
                match StreamReader::register(&self.streams, Arc::clone(socket), Some(control), hwm) {
                    Ok(reader) => {
                        let local = reader.local_id();
                        (ctx.with_reader(reader), local)
                    }
                    Err(e) => return self.reject_stream(correlation, e),
                }
            }
            _ => match StreamWriter::register(&self.streams, Arc::clone(socket), Some(control), hwm) {
                Ok(writer) => {
                    let local = writer.local_id();
                    (ctx.with_writer(writer), local)
                }
                Err(e) => return self.reject_stream(correlation, e),
            },
        };

        let socket = Arc::clone(socket);
        tokio::spawn(async move {
            middleware::drive(ctx.clone(), layers, handlers).await;
            if !ctx.is_responded() {
                release(&ctx);
                return;
            }
            match ctx.error() {
                Some(error) => {
                    release(&ctx);
                    unit.answer(Frame::stream_reject(correlation, &error)).await;
                }
                None => {
                    let frame = Frame::StreamResolve {
                        correlation,
                        control: local,
                        body: ctx.response().into(),
                    };
                    match frame.encode() {
                        Ok(bytes) => {
                            if let Err(e) = socket.send(bytes).await {
                                debug!("Stream resolve to unit {} not sent: {e}", unit.id);
                            }
                        }
                        Err(e) => warn!("Stream resolve not encodable: {e}"),
                    }
                }
            }
        });
    }

    fn reject_stream(self: &Arc<Self>, correlation: u64, error: MeshError) {
        let unit = Arc::clone(self);
        tokio::spawn(async move {
            unit.answer(Frame::stream_reject(correlation, &error.to_string()))
                .await;
        });
    }

    async fn answer(&self, frame: Frame) {
        let sent = match frame.encode() {
            Ok(bytes) => self.send_frame(bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            debug!("Answer to unit {} not sent: {e}", self.id);
        }
    }

    /// The remote broke the protocol: fail everything and drop its sockets.
    fn protocol_error(self: &Arc<Self>, error: String) {
        warn!("Protocol error on unit {}: {error}", self.id);
        if let Some(peer) = self.peer.upgrade() {
            peer.unit_error(self, &error);
        }
        let pending: Vec<_> = self.correlations.lock().pending.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(MeshError::Protocol(error.clone())));
        }
        self.streams.close_all(&error);
        for socket in self.sockets.read().iter() {
            socket.close(close_code::PROTOCOL_ERROR, "PROTOCOL ERROR");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str) -> Arc<Self> {
        Self::detached_serving(name, &[])
    }

    #[cfg(test)]
    pub(crate) fn detached_serving(name: &str, roles: &[&str]) -> Arc<Self> {
        let identity = IdentityPayload {
            id: PeerId::generate(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            friendly: true,
            name: name.to_string(),
            meta: PeerMeta::current(),
            tags: BTreeMap::new(),
        };
        Arc::new(Self::new(
            identity,
            None,
            Weak::new(),
            UnitSettings {
                request_timeout: Duration::from_secs(1),
                high_water_mark: 1024,
            },
        ))
    }
}

/// Stream ends the handler never took are dropped without notice.
fn release(ctx: &Context) {
    let (reader, writer) = ctx.release_streams();
    if let Some(reader) = reader {
        reader.discard();
    }
    if let Some(writer) = writer {
        writer.discard();
    }
}

/// Stream rejections carry `{"data": message}`; fall back to the raw text.
fn stream_error_text(payload: &Payload) -> String {
    let text = payload.to_text();
    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|value| value.get("data").map(|data| match data {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
        .unwrap_or(text)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_wrap_and_skip_pending() {
        let mut correlations = Correlations {
            last: CORRELATION_LIMIT - 2,
            ..Default::default()
        };
        let (tx, _rx) = oneshot::channel();
        correlations.pending.insert(1, tx);

        assert_eq!(correlations.allocate(), CORRELATION_LIMIT - 1);
        // Wraps past the limit and skips the pending id 1.
        assert_eq!(correlations.allocate(), 2);
    }

    #[test]
    fn test_stream_error_text_unwraps_data() {
        assert_eq!(
            stream_error_text(&Payload::from(r#"{"data":"denied"}"#)),
            "denied"
        );
        assert_eq!(stream_error_text(&Payload::from("plain")), "plain");
        assert_eq!(stream_error_text(&Payload::from(r#"{"data":3}"#)), "3");
    }

    #[tokio::test]
    async fn test_settle_is_exactly_once() {
        let unit = Unit::detached("u");
        let (id, rx) = unit.register();
        unit.settle(id, Reply::Rejected("first".into()));
        unit.settle(id, Reply::Rejected("second".into()));
        match rx.await.unwrap() {
            Ok(Reply::Rejected(message)) => assert_eq!(message, "first"),
            _ => panic!("expected the first rejection"),
        }
        assert_eq!(unit.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_without_sockets_fails_fast() {
        let unit = Unit::detached("u");
        let result = unit.request("r", "e", Payload::Null, None).await;
        assert!(matches!(result, Err(MeshError::SocketsClosed)));
        assert_eq!(unit.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_timeout_forgets_correlation() {
        let unit = Unit::detached("u");
        let (id, rx) = unit.register();
        let result = unit
            .await_reply(id, rx, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(MeshError::Timeout(_))));
        assert_eq!(unit.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_marks_closed() {
        let unit = Unit::detached("u");
        let (_, rx) = unit.register();
        unit.shutdown(|| MeshError::SocketsClosed);
        assert!(matches!(rx.await.unwrap(), Err(MeshError::SocketsClosed)));
        assert!(unit.is_closed());
        tokio::time::timeout(Duration::from_secs(1), unit.closed())
            .await
            .unwrap();
    }

    #[test]
    fn test_roles_apply_only_when_newer() {
        let unit = Unit::detached("u");
        unit.apply_roles(RolesUpdate {
            i: 2,
            roles: vec!["a".into()],
        });
        unit.apply_roles(RolesUpdate {
            i: 1,
            roles: vec!["stale".into()],
        });
        unit.apply_roles(RolesUpdate {
            i: 2,
            roles: vec!["duplicate".into()],
        });
        assert_eq!(unit.roles(), vec!["a".to_string()]);
        assert!(unit.has_role("a"));
    }

    #[tokio::test]
    async fn test_protocol_error_tears_the_unit_down() {
        use crate::config::{ConnectOptions, ListenOptions, MeshConfig};
        use crate::events::PeerEvent;
        use crate::peer::Peer;

        let server = Peer::new(MeshConfig::named("server")).unwrap();
        let role = server.role("svc");
        role.on_request("hang", |_ctx: Context| async move { Ok(()) });
        role.on_writable("hold", |ctx: Context| async move {
            let writer = ctx.take_writer();
            ctx.reply(())?;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(writer);
            });
            Ok(())
        });
        let addr = server
            .listen(ListenOptions::new("127.0.0.1", 0))
            .await
            .unwrap();

        let client = Peer::new(MeshConfig::named("client")).unwrap();
        let mut events = client.subscribe();
        let unit = client
            .connect(&format!("ws://{addr}"), ConnectOptions::once())
            .await
            .unwrap();

        let mut reader = unit
            .open_readable("svc", "hold", Payload::Null, None)
            .await
            .unwrap();
        let pending = {
            let unit = Arc::clone(&unit);
            tokio::spawn(async move { unit.request("svc", "hang", Payload::Null, None).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while unit.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let socket = unit.pick_socket().unwrap();
        unit.handle_payload(&socket, Bytes::from_static(&[0xFF]));

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(&result, Err(MeshError::Protocol(m)) if m.contains("implements the protocol")),
            "{result:?}"
        );

        let chunk = tokio::time::timeout(Duration::from_secs(2), reader.next_chunk())
            .await
            .unwrap();
        assert!(matches!(chunk, Some(Err(MeshError::Stream(_)))), "{chunk:?}");

        let code = tokio::time::timeout(Duration::from_secs(5), socket.closed())
            .await
            .unwrap();
        assert_eq!(code, Some(close_code::PROTOCOL_ERROR));

        let reported = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::UnitError { unit, error }) => return (unit, error),
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {e}"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(&reported.0, unit.id());
        assert!(reported.1.contains("implements the protocol"));
    }
}
