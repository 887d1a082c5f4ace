//! Incoming-call context handed to layers and handlers, and the result types
//! of outgoing calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{MeshError, Result};
use crate::protocol::{Body, Origin, Payload};
use crate::stream::{StreamReader, StreamWriter};
use crate::unit::Unit;

/// The four kinds of incoming communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Communication {
    /// One-way message; nothing is sent back.
    Message,
    /// Request expecting a response or a rejection.
    Request,
    /// The remote opened a writable stream; the handler reads.
    Readable,
    /// The remote opened a readable stream; the handler writes.
    Writable,
}

impl Communication {
    pub fn expects_answer(self) -> bool {
        self != Self::Message
    }
}

impl std::fmt::Display for Communication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Message => "message",
            Self::Request => "request",
            Self::Readable => "readable",
            Self::Writable => "writable",
        })
    }
}

/// Shared state of one incoming message, request or stream request.
///
/// Cloning is cheap; every layer and handler sees the same context. The
/// response is sent once the exchange is completed (through [`reply`] or
/// [`reject`]) and every layer suspended in `next()` has resumed, so outer
/// layers may still adjust the response on the way out.
///
/// [`reply`]: Context::reply
/// [`reject`]: Context::reject
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    kind: Communication,
    unit: Arc<Unit>,
    role: String,
    event: String,
    data: Mutex<Payload>,
    origin: Origin,
    response: Mutex<Payload>,
    error: Mutex<Option<String>>,
    responded: AtomicBool,
    completed: watch::Sender<bool>,
    reader: Mutex<Option<StreamReader>>,
    writer: Mutex<Option<StreamWriter>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.inner.kind)
            .field("unit", &self.inner.unit.id())
            .field("role", &self.inner.role)
            .field("event", &self.inner.event)
            .field("responded", &self.is_responded())
            .finish()
    }
}

impl Context {
    pub(crate) fn new(
        kind: Communication,
        unit: Arc<Unit>,
        role: String,
        event: String,
        body: Body,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                kind,
                unit,
                role,
                event,
                data: Mutex::new(body.payload),
                origin: body.origin,
                response: Mutex::new(Payload::Null),
                error: Mutex::new(None),
                responded: AtomicBool::new(false),
                completed: watch::Sender::new(false),
                reader: Mutex::new(None),
                writer: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn with_reader(self, reader: StreamReader) -> Self {
        *self.inner.reader.lock() = Some(reader);
        self
    }

    pub(crate) fn with_writer(self, writer: StreamWriter) -> Self {
        *self.inner.writer.lock() = Some(writer);
        self
    }

    pub fn kind(&self) -> Communication {
        self.inner.kind
    }

    /// The unit the call came from.
    pub fn unit(&self) -> &Arc<Unit> {
        &self.inner.unit
    }

    pub fn role(&self) -> &str {
        &self.inner.role
    }

    pub fn event(&self) -> &str {
        &self.inner.event
    }

    pub fn data(&self) -> Payload {
        self.inner.data.lock().clone()
    }

    pub fn set_data(&self, data: impl Into<Payload>) {
        *self.inner.data.lock() = data.into();
    }

    /// The payload as it arrived on the wire.
    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub fn response(&self) -> Payload {
        self.inner.response.lock().clone()
    }

    pub fn set_response(&self, response: impl Into<Payload>) {
        *self.inner.response.lock() = response.into();
    }

    pub fn error(&self) -> Option<String> {
        self.inner.error.lock().clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        *self.inner.error.lock() = error;
    }

    /// Complete the exchange successfully with `response`.
    pub fn reply(&self, response: impl Into<Payload>) -> Result<()> {
        self.claim()?;
        *self.inner.response.lock() = response.into();
        *self.inner.error.lock() = None;
        self.inner.completed.send_replace(true);
        Ok(())
    }

    /// Complete the exchange with an error sent back to the caller.
    pub fn reject(&self, error: impl Into<String>) -> Result<()> {
        self.claim()?;
        *self.inner.error.lock() = Some(error.into());
        self.inner.completed.send_replace(true);
        Ok(())
    }

    pub fn is_responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }

    /// The reader of a stream the remote writes into.
    pub fn take_reader(&self) -> Option<StreamReader> {
        self.inner.reader.lock().take()
    }

    /// The writer of a stream the remote reads from.
    pub fn take_writer(&self) -> Option<StreamWriter> {
        self.inner.writer.lock().take()
    }

    fn claim(&self) -> Result<()> {
        if !self.inner.kind.expects_answer() {
            return Err(MeshError::Protocol(format!(
                "{} \"{}\" cannot be answered",
                self.inner.kind, self.inner.event
            )));
        }
        self.inner
            .responded
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| MeshError::AlreadyResponded)
    }

    pub(crate) fn completed(&self) -> watch::Receiver<bool> {
        self.inner.completed.subscribe()
    }

    /// Mark a message as processed. Has no effect on other kinds.
    pub(crate) fn finish_message(&self) {
        if self.inner.kind == Communication::Message {
            self.inner.completed.send_replace(true);
        }
    }

    /// Drop stream ends the handler never claimed.
    pub(crate) fn release_streams(&self) -> (Option<StreamReader>, Option<StreamWriter>) {
        (self.take_reader(), self.take_writer())
    }
}

/// Result of a request.
#[derive(Debug, Clone)]
pub struct Response {
    pub data: Payload,
    pub origin: Origin,
    /// The unit that answered.
    pub unit: Arc<Unit>,
    /// Time from sending the request to receiving the answer.
    pub rtt: Duration,
}

/// What the remote answered when it accepted a stream.
#[derive(Debug, Clone)]
pub struct StreamReady {
    pub data: Payload,
    pub origin: Origin,
    pub unit: Arc<Unit>,
}
