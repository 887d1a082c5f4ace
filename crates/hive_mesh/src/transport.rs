//! WebSocket transport: sockets, dialing and the listener loop.
//!
//! Every WebSocket gets two background tasks: a writer draining the
//! socket's outbound queue into the sink, and a reader forwarding binary
//! frames into an mpsc channel. A [`Socket`] is the cheap handle the rest of
//! the crate holds on to; the inbound receiver is consumed first by the
//! handshake and then by the unit that owns the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async_tls_with_config,
};
use tracing::{debug, error, info, warn};

use crate::config::{ListenOptions, TlsConfig};
use crate::error::{MeshError, Result};
use crate::protocol::close_code;

/// How long a closing socket waits for the remote close frame.
const CLOSE_HANDSHAKE_GRACE: Duration = Duration::from_secs(2);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    /// Closed, with the close code if one was exchanged.
    Closed(Option<u16>),
}

enum Outbound {
    Data(Bytes, Option<oneshot::Sender<Result<()>>>),
    Ping,
    Close(u16, String),
}

/// Handle to one live WebSocket connection.
pub struct Socket {
    id: u64,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: watch::Sender<SocketState>,
    pongs: watch::Sender<u64>,
    requested_close: Mutex<Option<u16>>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Socket {
    /// Process-unique id of this socket.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Send one binary frame; resolves once it was written to the transport.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(MeshError::Transport(format!("socket {} is not open", self.id)));
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Data(bytes, Some(ack_tx)))
            .map_err(|_| MeshError::Transport(format!("socket {} writer is gone", self.id)))?;
        ack_rx.await.map_err(|_| {
            MeshError::Transport(format!("socket {} closed before the frame was written", self.id))
        })?
    }

    /// Queue a frame without waiting for it to be written.
    pub fn enqueue(&self, bytes: Bytes) {
        if self.is_open() {
            let _ = self.outbound.send(Outbound::Data(bytes, None));
        }
    }

    /// Start the close handshake with the given code.
    pub fn close(&self, code: u16, reason: &str) {
        let started = self.state.send_if_modified(|state| {
            if *state == SocketState::Open {
                *state = SocketState::Closing;
                true
            } else {
                false
            }
        });
        if started {
            *self.requested_close.lock() = Some(code);
            let _ = self.outbound.send(Outbound::Close(code, reason.to_string()));
        }
    }

    /// Resolves once the socket is fully closed, with its close code.
    pub async fn closed(&self) -> Option<u16> {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|s| matches!(s, SocketState::Closed(_))).await {
            Ok(state) => match *state {
                SocketState::Closed(code) => code,
                _ => None,
            },
            Err(_) => None,
        }
    }

    fn ping(&self) {
        let _ = self.outbound.send(Outbound::Ping);
    }

    fn mark_closed(&self, code: Option<u16>) {
        let code = code.or(*self.requested_close.lock());
        self.state.send_replace(SocketState::Closed(code));
    }
}

/// A freshly attached socket and the stream of binary frames it receives.
pub(crate) struct Connection {
    pub socket: Arc<Socket>,
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

/// Wrap an upgraded WebSocket, spawning its reader and writer tasks.
pub(crate) fn attach<S>(ws: WebSocketStream<S>, peer_addr: Option<SocketAddr>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let socket = Arc::new(Socket {
        id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
        peer_addr,
        outbound: out_tx,
        state: watch::Sender::new(SocketState::Open),
        pongs: watch::Sender::new(0),
        requested_close: Mutex::new(None),
    });

    let (sink, stream) = ws.split();
    tokio::spawn(write_loop(sink, out_rx, Arc::clone(&socket)));
    tokio::spawn(read_loop(stream, in_tx, Arc::clone(&socket)));

    Connection {
        socket,
        inbound: in_rx,
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    socket: Arc<Socket>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = socket.state.subscribe();
    drop(socket);
    loop {
        let item = tokio::select! {
            item = rx.recv() => item,
            _ = state.wait_for(|s| matches!(s, SocketState::Closed(_))) => None,
        };
        match item {
            Some(Outbound::Data(bytes, ack)) => {
                let result = sink
                    .send(Message::Binary(bytes))
                    .await
                    .map_err(|e| MeshError::Transport(format!("Send error: {e}")));
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Some(Outbound::Ping) => {
                if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                    debug!("Ping failed: {e}");
                }
            }
            Some(Outbound::Close(code, reason)) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!("Close frame not sent: {e}");
                }
                break;
            }
            None => break,
        }
    }
}

async fn read_loop<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::UnboundedSender<Bytes>,
    socket: Arc<Socket>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = socket.state.subscribe();
    let closing = async move {
        let _ = state.wait_for(|s| *s != SocketState::Open).await;
        tokio::time::sleep(CLOSE_HANDSHAKE_GRACE).await;
    };
    tokio::pin!(closing);

    let mut code = None;
    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = inbound.send(bytes);
                }
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Pong(_))) => {
                    socket.pongs.send_modify(|n| *n += 1);
                }
                Some(Ok(Message::Close(frame))) => {
                    // Keep reading so tungstenite can flush the close reply.
                    code = code.or(frame.map(|f| u16::from(f.code)));
                    debug!("Socket {} received close {code:?}", socket.id);
                    socket.state.send_if_modified(|state| {
                        if *state == SocketState::Open {
                            *state = SocketState::Closing;
                            true
                        } else {
                            false
                        }
                    });
                }
                // tungstenite answers pings on its own.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Read error on socket {}: {e}", socket.id);
                    break;
                }
                None => break,
            },
            _ = &mut closing => {
                debug!("Socket {} close handshake timed out", socket.id);
                break;
            }
        }
    }

    socket.mark_closed(code);
}

/// Ping the socket every `interval`; close it when no pong comes back in `timeout`.
pub(crate) async fn heartbeat(socket: Arc<Socket>, interval: Duration, timeout: Duration) {
    let mut pongs = socket.pongs.subscribe();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = socket.closed() => return,
        }
        if !socket.is_open() {
            return;
        }
        let _ = pongs.borrow_and_update();
        socket.ping();
        match tokio::time::timeout(timeout, pongs.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return,
            Err(_) => {
                warn!("Socket {} missed its heartbeat, closing", socket.id);
                socket.close(close_code::HEARTBEAT_TIMEOUT, "PING TIMEOUT");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Turn `host:port` into a WebSocket URL; URLs are kept as they are.
pub(crate) fn normalize_address(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    }
}

/// Connect to a remote peer as a client.
pub(crate) async fn dial(
    addr: &str,
    accept_invalid_certs: bool,
    timeout: Duration,
) -> Result<Connection> {
    let url = normalize_address(addr);
    let connector = if accept_invalid_certs {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| MeshError::Transport(format!("TLS connector: {e}")))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws, _) = tokio::time::timeout(
        timeout,
        connect_async_tls_with_config(url.as_str(), None, false, connector),
    )
    .await
    .map_err(|_| MeshError::Timeout(timeout))?
    .map_err(|e| MeshError::Transport(format!("Connect to {addr} failed: {e}")))?;

    let peer_addr = match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        _ => None,
    };
    debug!("Connected to {url}");
    Ok(attach(ws, peer_addr))
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// A bound TCP listener, optionally wrapped in TLS.
pub(crate) struct Listener {
    tcp: TcpListener,
    tls: Option<tokio_native_tls::TlsAcceptor>,
    path: Option<String>,
}

impl Listener {
    pub async fn bind(options: &ListenOptions) -> Result<Self> {
        let tls = options.tls.as_ref().map(tls_acceptor).transpose()?;
        let tcp = TcpListener::bind((options.host.as_str(), options.port)).await?;
        Ok(Self {
            tcp,
            tls,
            path: options.path.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Accept connections until `shutdown` fires, handing each upgraded
    /// socket to `conn_tx`.
    pub async fn serve(
        self,
        conn_tx: mpsc::Sender<Connection>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        if let Ok(addr) = self.tcp.local_addr() {
            info!("WebSocket server listening on {addr}");
        }
        loop {
            tokio::select! {
                accept_result = self.tcp.accept() => match accept_result {
                    Ok((stream, peer_addr)) => {
                        let tls = self.tls.clone();
                        let path = self.path.clone();
                        let conn_tx = conn_tx.clone();
                        tokio::spawn(async move {
                            match accept_one(stream, peer_addr, tls, path).await {
                                Ok(conn) => {
                                    let _ = conn_tx.send(conn).await;
                                }
                                Err(e) => warn!("Rejected connection from {peer_addr}: {e}"),
                            }
                        });
                    }
                    Err(e) => error!("TCP accept failed: {e}"),
                },
                _ = shutdown.recv() => {
                    info!("WebSocket server shutting down");
                    break;
                }
            }
        }
    }
}

async fn accept_one(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<tokio_native_tls::TlsAcceptor>,
    path: Option<String>,
) -> Result<Connection> {
    match tls {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| MeshError::Transport(format!("TLS accept failed: {e}")))?;
            let ws = upgrade(stream, path).await?;
            Ok(attach(ws, Some(peer_addr)))
        }
        None => {
            let ws = upgrade(stream, path).await?;
            Ok(attach(ws, Some(peer_addr)))
        }
    }
}

async fn upgrade<S>(stream: S, path: Option<String>) -> Result<WebSocketStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let check_path = move |request: &Request, response: Response| {
        match &path {
            Some(expected) if request.uri().path() != expected.as_str() => {
                let mut refusal = ErrorResponse::new(Some(format!(
                    "unexpected path {}",
                    request.uri().path()
                )));
                *refusal.status_mut() = StatusCode::BAD_REQUEST;
                Err(refusal)
            }
            _ => Ok(response),
        }
    };
    accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| MeshError::Transport(format!("WebSocket accept failed: {e}")))
}

fn tls_acceptor(tls: &TlsConfig) -> Result<tokio_native_tls::TlsAcceptor> {
    let cert = std::fs::read(&tls.cert).map_err(|e| {
        MeshError::Config(format!("cannot read certificate {}: {e}", tls.cert.display()))
    })?;
    let key = std::fs::read(&tls.key)
        .map_err(|e| MeshError::Config(format!("cannot read key {}: {e}", tls.key.display())))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| MeshError::Config(format!("invalid certificate or key: {e}")))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|e| MeshError::Config(format!("TLS acceptor: {e}")))?;
    Ok(tokio_native_tls::TlsAcceptor::from(acceptor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
