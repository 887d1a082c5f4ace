//! Credit-based byte streams multiplexed over a unit's socket.
//!
//! A stream has two ends, each registered on its own unit's [`StreamBus`]
//! under a short random id. The reader's id is where chunks go; the
//! writer's id is where credit (QUOTA) and reader errors go. The writer may
//! only have `high_water_mark` unacknowledged bytes in flight; the reader
//! hands out more credit as its consumer drains the buffer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::context::StreamReady;
use crate::error::{MeshError, Result};
use crate::protocol::frame::stream_header;
use crate::protocol::{StreamFlag, decode_number, encode_number};
use crate::transport::Socket;

/// One local end of a stream, as seen by the bus.
pub(crate) trait StreamEndpoint: Send + Sync {
    /// Id of the socket the stream is bound to.
    fn socket_id(&self) -> u64;
    fn on_frame(&self, flag: StreamFlag, body: Bytes);
    fn fail(&self, message: String);
}

/// Per-unit registry of open stream ends, keyed by stream id.
#[derive(Default)]
pub(crate) struct StreamBus {
    endpoints: Mutex<HashMap<u64, Arc<dyn StreamEndpoint>>>,
}

impl StreamBus {
    /// Register a new endpoint under a free id. Ids are two random bytes,
    /// never zero, probed upward past ids in use.
    fn register<E, F>(&self, make: F) -> Result<Arc<E>>
    where
        E: StreamEndpoint + 'static,
        F: FnOnce(u64) -> E,
    {
        let mut endpoints = self.endpoints.lock();
        let mut id = u64::from(rand::random::<u16>().max(1));
        for _ in 0..u16::MAX {
            if !endpoints.contains_key(&id) {
                let endpoint = Arc::new(make(id));
                endpoints.insert(id, Arc::clone(&endpoint) as Arc<dyn StreamEndpoint>);
                return Ok(endpoint);
            }
            id = if id >= u64::from(u16::MAX) { 1 } else { id + 1 };
        }
        Err(MeshError::Stream("no free stream id".into()))
    }

    /// Route a stream message to its endpoint. Returns false for unknown ids.
    pub fn dispatch(&self, stream_id: u64, flag: StreamFlag, body: Bytes) -> bool {
        let endpoint = self.endpoints.lock().get(&stream_id).cloned();
        match endpoint {
            Some(endpoint) => {
                endpoint.on_frame(flag, body);
                true
            }
            None => {
                debug!("Dropping stream message for unknown stream {stream_id}");
                false
            }
        }
    }

    pub fn remove(&self, stream_id: u64) {
        self.endpoints.lock().remove(&stream_id);
    }

    /// Fail and forget every stream bound to `socket_id`.
    pub fn socket_closed(&self, socket_id: u64) {
        let dropped: Vec<_> = {
            let mut endpoints = self.endpoints.lock();
            let ids: Vec<u64> = endpoints
                .iter()
                .filter(|(_, e)| e.socket_id() == socket_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| endpoints.remove(&id))
                .collect()
        };
        for endpoint in dropped {
            endpoint.fail("Underlying socket closed".into());
        }
    }

    /// Fail and forget every stream.
    pub fn close_all(&self, message: &str) {
        let dropped: Vec<_> = self.endpoints.lock().drain().map(|(_, e)| e).collect();
        for endpoint in dropped {
            endpoint.fail(message.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }
}

/// Addressing shared by both ends.
struct Link {
    local: u64,
    remote: Mutex<Option<u64>>,
    socket: Arc<Socket>,
    bus: Weak<StreamBus>,
}

impl Link {
    fn frame(&self, flag: StreamFlag, body: &[u8]) -> Option<Bytes> {
        let remote = (*self.remote.lock())?;
        let header = stream_header(remote);
        let mut out = BytesMut::with_capacity(header.len() + 1 + body.len());
        out.put_slice(&header);
        out.put_u8(flag.byte());
        out.put_slice(body);
        Some(out.freeze())
    }

    fn enqueue(&self, flag: StreamFlag, body: &[u8]) {
        if let Some(frame) = self.frame(flag, body) {
            self.socket.enqueue(frame);
        }
    }

    async fn send(&self, flag: StreamFlag, body: &[u8]) -> Result<()> {
        let frame = self
            .frame(flag, body)
            .ok_or_else(|| MeshError::Stream("stream is not bound to a remote end".into()))?;
        self.socket.send(frame).await
    }

    fn detach(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.local);
        }
    }
}

/// Credit the reader should grant, if any.
///
/// `remaining` is the credit the writer still holds and `buffered` the bytes
/// received but not yet consumed.
fn credit_to_grant(high_water_mark: i64, remaining: i64, buffered: i64) -> Option<i64> {
    if remaining > high_water_mark / 2 {
        return None;
    }
    let grant = high_water_mark - remaining - buffered;
    (grant > 0).then_some(grant)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct ReaderState {
    chunks: VecDeque<Bytes>,
    buffered: i64,
    remaining: i64,
    /// `Some(Ok)` once finished, `Some(Err)` once failed.
    end: Option<std::result::Result<(), String>>,
}

struct ReaderEnd {
    link: Link,
    high_water_mark: i64,
    state: Mutex<ReaderState>,
    notify: Notify,
}

impl ReaderEnd {
    fn maybe_grant(&self) {
        if self.link.remote.lock().is_none() {
            return;
        }
        let grant = {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return;
            }
            let grant = credit_to_grant(self.high_water_mark, state.remaining, state.buffered);
            if let Some(grant) = grant {
                state.remaining += grant;
            }
            grant
        };
        if let Some(grant) = grant {
            self.link
                .enqueue(StreamFlag::Quota, &encode_number(grant as u64));
        }
    }

    fn end(&self, result: std::result::Result<(), String>) {
        {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return;
            }
            state.end = Some(result);
        }
        self.notify.notify_waiters();
    }
}

impl StreamEndpoint for ReaderEnd {
    fn socket_id(&self) -> u64 {
        self.link.socket.id()
    }

    fn on_frame(&self, flag: StreamFlag, body: Bytes) {
        match flag {
            StreamFlag::Chunk => {
                {
                    let mut state = self.state.lock();
                    if state.end.is_some() {
                        return;
                    }
                    let len = body.len() as i64;
                    state.remaining -= len;
                    state.buffered += len;
                    state.chunks.push_back(body);
                }
                self.notify.notify_waiters();
                self.maybe_grant();
            }
            StreamFlag::Finish => {
                self.link.detach();
                self.end(Ok(()));
            }
            StreamFlag::Error => {
                self.link.detach();
                self.end(Err(format!(
                    "Remote writable stream emitted error: {}",
                    String::from_utf8_lossy(&body)
                )));
            }
            StreamFlag::Quota => debug!("Reader {} ignores credit", self.link.local),
        }
    }

    fn fail(&self, message: String) {
        self.end(Err(message));
    }
}

/// Receiving end of a flow-controlled stream.
pub struct StreamReader {
    end: Arc<ReaderEnd>,
    ready: Option<StreamReady>,
    done: bool,
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("id", &self.end.link.local)
            .field("remote", &*self.end.link.remote.lock())
            .finish()
    }
}

impl StreamReader {
    /// Register a reader on `bus`. `remote` is the writer's id when known.
    pub(crate) fn register(
        bus: &Arc<StreamBus>,
        socket: Arc<Socket>,
        remote: Option<u64>,
        high_water_mark: usize,
    ) -> Result<Self> {
        let weak = Arc::downgrade(bus);
        let high_water_mark = high_water_mark as i64;
        let end = bus.register(|local| ReaderEnd {
            link: Link {
                local,
                remote: Mutex::new(remote),
                socket,
                bus: weak,
            },
            high_water_mark,
            state: Mutex::new(ReaderState {
                chunks: VecDeque::new(),
                buffered: 0,
                remaining: high_water_mark,
                end: None,
            }),
            notify: Notify::new(),
        })?;
        Ok(Self {
            end,
            ready: None,
            done: false,
        })
    }

    pub(crate) fn local_id(&self) -> u64 {
        self.end.link.local
    }

    /// Learn the writer's id once the remote accepted the stream.
    pub(crate) fn bind_remote(&self, remote: u64) {
        *self.end.link.remote.lock() = Some(remote);
        self.end.maybe_grant();
    }

    pub(crate) fn with_ready(mut self, ready: StreamReady) -> Self {
        self.ready = Some(ready);
        self
    }

    /// What the remote answered when it accepted a stream we opened.
    pub fn ready(&self) -> Option<&StreamReady> {
        self.ready.as_ref()
    }

    /// The next chunk, `None` at the end of the stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        loop {
            let notified = self.end.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.end.state.lock();
                if let Some(chunk) = state.chunks.pop_front() {
                    state.buffered -= chunk.len() as i64;
                    Some(Some(Ok(chunk)))
                } else {
                    match &state.end {
                        Some(Ok(())) => Some(None),
                        Some(Err(message)) => Some(Some(Err(MeshError::Stream(message.clone())))),
                        None => None,
                    }
                }
            };
            match step {
                Some(Some(Ok(chunk))) => {
                    self.end.maybe_grant();
                    return Some(Ok(chunk));
                }
                Some(other) => {
                    self.done = true;
                    return other;
                }
                None => notified.await,
            }
        }
    }

    /// Collect the whole stream.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }

    /// Forget a reader whose stream was never accepted.
    pub(crate) fn discard(mut self) {
        self.done = true;
        self.end.link.detach();
    }

    /// Stop reading and tell the writer why.
    pub fn abort(mut self, message: &str) {
        self.shut(message);
    }

    fn shut(&mut self, message: &str) {
        if self.done {
            return;
        }
        self.done = true;
        let open = self.end.state.lock().end.is_none();
        if open {
            self.end.link.enqueue(StreamFlag::Error, message.as_bytes());
            self.end.end(Err(message.to_string()));
        }
        self.end.link.detach();
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.shut("Readable stream was dropped");
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

struct WriterState {
    credit: i64,
    failed: Option<String>,
}

struct WriterEnd {
    link: Link,
    state: Mutex<WriterState>,
    notify: Notify,
}

impl WriterEnd {
    fn fail_with(&self, message: String) {
        {
            let mut state = self.state.lock();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(message);
        }
        self.notify.notify_waiters();
    }
}

impl StreamEndpoint for WriterEnd {
    fn socket_id(&self) -> u64 {
        self.link.socket.id()
    }

    fn on_frame(&self, flag: StreamFlag, body: Bytes) {
        match flag {
            StreamFlag::Quota => match decode_number(&body) {
                Ok(grant) => {
                    self.state.lock().credit += grant as i64;
                    self.notify.notify_waiters();
                }
                Err(e) => debug!("Writer {} got bad credit: {e}", self.link.local),
            },
            StreamFlag::Error => {
                self.link.detach();
                self.fail_with(format!(
                    "Remote readable stream sent error: {}",
                    String::from_utf8_lossy(&body)
                ));
            }
            other => debug!("Writer {} ignores {other:?}", self.link.local),
        }
    }

    fn fail(&self, message: String) {
        self.fail_with(message);
    }
}

/// Sending end of a flow-controlled stream.
///
/// Dropping a writer before [`StreamWriter::finish`] aborts the stream on
/// the remote side.
pub struct StreamWriter {
    end: Arc<WriterEnd>,
    ready: Option<StreamReady>,
    closed: bool,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("id", &self.end.link.local)
            .field("remote", &*self.end.link.remote.lock())
            .finish()
    }
}

impl StreamWriter {
    /// Register a writer on `bus`. `remote` is the reader's id when known.
    pub(crate) fn register(
        bus: &Arc<StreamBus>,
        socket: Arc<Socket>,
        remote: Option<u64>,
        high_water_mark: usize,
    ) -> Result<Self> {
        let weak = Arc::downgrade(bus);
        let end = bus.register(|local| WriterEnd {
            link: Link {
                local,
                remote: Mutex::new(remote),
                socket,
                bus: weak,
            },
            state: Mutex::new(WriterState {
                credit: high_water_mark as i64,
                failed: None,
            }),
            notify: Notify::new(),
        })?;
        Ok(Self {
            end,
            ready: None,
            closed: false,
        })
    }

    pub(crate) fn local_id(&self) -> u64 {
        self.end.link.local
    }

    pub(crate) fn bind_remote(&self, remote: u64) {
        *self.end.link.remote.lock() = Some(remote);
    }

    pub(crate) fn with_ready(mut self, ready: StreamReady) -> Self {
        self.ready = Some(ready);
        self
    }

    /// What the remote answered when it accepted a stream we opened.
    pub fn ready(&self) -> Option<&StreamReady> {
        self.ready.as_ref()
    }

    /// Send one chunk, waiting for credit first.
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        if self.closed {
            return Err(MeshError::Stream("stream already finished".into()));
        }
        let chunk = chunk.into();
        loop {
            let notified = self.end.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.end.state.lock();
                if let Some(message) = &state.failed {
                    return Err(MeshError::Stream(message.clone()));
                }
                if state.credit > 0 {
                    state.credit -= chunk.len() as i64;
                    break;
                }
            }
            notified.await;
        }
        if let Err(e) = self.end.link.send(StreamFlag::Chunk, &chunk).await {
            let message = format!("Underlying socket has been closed: {e}");
            self.end.fail_with(message.clone());
            self.end.link.detach();
            return Err(MeshError::Stream(message));
        }
        Ok(())
    }

    /// Signal the end of the stream.
    pub async fn finish(mut self) -> Result<()> {
        self.closed = true;
        self.end.link.detach();
        if let Some(message) = self.end.state.lock().failed.clone() {
            return Err(MeshError::Stream(message));
        }
        self.end.link.send(StreamFlag::Finish, &[]).await
    }

    /// Forget a writer whose stream was never accepted.
    pub(crate) fn discard(mut self) {
        self.closed = true;
        self.end.link.detach();
    }

    /// Fail the stream, passing `message` to the reader.
    pub fn abort(mut self, message: &str) {
        self.shut(message);
    }

    fn shut(&mut self, message: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.end.state.lock().failed.is_none() {
            self.end.link.enqueue(StreamFlag::Error, message.as_bytes());
        }
        self.end.link.detach();
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.shut("Writable stream was dropped before finishing");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        socket: u64,
        frames: AtomicUsize,
        failures: Mutex<Vec<String>>,
    }

    impl Probe {
        fn new(socket: u64) -> Self {
            Self {
                socket,
                frames: AtomicUsize::new(0),
                failures: Mutex::new(Vec::new()),
            }
        }
    }

    impl StreamEndpoint for Probe {
        fn socket_id(&self) -> u64 {
            self.socket
        }

        fn on_frame(&self, _flag: StreamFlag, _body: Bytes) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }

        fn fail(&self, message: String) {
            self.failures.lock().push(message);
        }
    }

    #[test]
    fn test_credit_is_granted_below_half_mark() {
        assert_eq!(credit_to_grant(100, 60, 0), None);
        assert_eq!(credit_to_grant(100, 50, 0), Some(50));
        assert_eq!(credit_to_grant(100, 10, 30), Some(60));
        // A slow consumer holds back credit until it drains.
        assert_eq!(credit_to_grant(100, 0, 100), None);
        // Overshooting writers are made whole again.
        assert_eq!(credit_to_grant(100, -20, 0), Some(120));
    }

    #[test]
    fn test_bus_ids_are_unique_and_non_zero() {
        let bus = StreamBus::default();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..500 {
            let mut id = 0;
            bus.register(|assigned| {
                id = assigned;
                Probe::new(1)
            })
            .unwrap();
            assert!(id != 0 && id <= u64::from(u16::MAX));
            assert!(ids.insert(id));
        }
        assert_eq!(bus.len(), 500);
    }

    #[test]
    fn test_dispatch_routes_by_id() {
        let bus = StreamBus::default();
        let mut assigned = 0;
        let probe = bus
            .register(|id| {
                assigned = id;
                Probe::new(1)
            })
            .unwrap();
        assert!(bus.dispatch(assigned, StreamFlag::Chunk, Bytes::new()));
        assert_eq!(probe.frames.load(Ordering::SeqCst), 1);

        bus.remove(assigned);
        assert!(!bus.dispatch(assigned, StreamFlag::Chunk, Bytes::new()));
        assert_eq!(probe.frames.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_socket_close_fails_only_bound_streams() {
        let bus = StreamBus::default();
        let on_one = bus.register(|_| Probe::new(1)).unwrap();
        let on_two = bus.register(|_| Probe::new(2)).unwrap();

        bus.socket_closed(1);
        assert_eq!(on_one.failures.lock().as_slice(), ["Underlying socket closed"]);
        assert!(on_two.failures.lock().is_empty());
        assert_eq!(bus.len(), 1);

        bus.close_all("unit closed");
        assert_eq!(on_two.failures.lock().as_slice(), ["unit closed"]);
        assert_eq!(bus.len(), 0);
    }
}
