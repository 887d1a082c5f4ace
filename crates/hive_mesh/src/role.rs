//! Local services.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::info;

use crate::context::{Communication, Context};
use crate::error::Result;
use crate::middleware::{self, Handler, Layer, LayerSet, Next};
use crate::peer::PeerInner;

/// A named capability of the local peer.
///
/// Handlers are registered per communication kind and event name. Enabling
/// or disabling a role is announced to every connected unit.
pub struct Role {
    name: String,
    active: AtomicBool,
    peer: Weak<PeerInner>,
    handlers: RwLock<HashMap<(Communication, String), Vec<Handler>>>,
    layers: RwLock<LayerSet>,
}

impl std::fmt::Debug for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Role")
            .field("name", &self.name)
            .field("active", &self.active())
            .finish()
    }
}

impl Role {
    pub(crate) fn new(name: String, active: bool, peer: Weak<PeerInner>) -> Self {
        Self {
            name,
            active: AtomicBool::new(active),
            peer,
            handlers: RwLock::new(HashMap::new()),
            layers: RwLock::new(LayerSet::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.set_active(true);
    }

    pub fn disable(&self) {
        self.set_active(false);
    }

    fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::SeqCst) == active {
            return;
        }
        info!(
            "Role \"{}\" {}",
            self.name,
            if active { "enabled" } else { "disabled" }
        );
        if let Some(peer) = self.peer.upgrade() {
            peer.roles_changed();
        }
    }

    // -- Event handlers -----------------------------------------------------

    pub fn on_message<F, Fut>(&self, event: impl Into<String>, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(Communication::Message, event.into(), middleware::handler(f));
    }

    pub fn on_request<F, Fut>(&self, event: impl Into<String>, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(Communication::Request, event.into(), middleware::handler(f));
    }

    /// Handle streams the remote writes into; take the reader with
    /// [`Context::take_reader`]. Data flows once the call was answered, so
    /// read from a spawned task.
    pub fn on_readable<F, Fut>(&self, event: impl Into<String>, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(Communication::Readable, event.into(), middleware::handler(f));
    }

    /// Handle streams the remote reads from; take the writer with
    /// [`Context::take_writer`].
    pub fn on_writable<F, Fut>(&self, event: impl Into<String>, f: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(Communication::Writable, event.into(), middleware::handler(f));
    }

    fn add_handler(&self, kind: Communication, event: String, handler: Handler) {
        self.handlers
            .write()
            .entry((kind, event))
            .or_default()
            .push(handler);
    }

    pub fn has_handler(&self, kind: Communication, event: &str) -> bool {
        self.handlers
            .read()
            .contains_key(&(kind, event.to_string()))
    }

    pub(crate) fn handlers(&self, kind: Communication, event: &str) -> Vec<Handler> {
        self.handlers
            .read()
            .get(&(kind, event.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    // -- Layers -------------------------------------------------------------

    /// Layer run for every kind of call to this role.
    pub fn on_data<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(None, middleware::layer(f));
    }

    pub fn on_any_message<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Message), middleware::layer(f));
    }

    pub fn on_any_request<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Request), middleware::layer(f));
    }

    pub fn on_any_readable<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Readable), middleware::layer(f));
    }

    pub fn on_any_writable<F, Fut>(&self, f: F)
    where
        F: Fn(Context, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_layer(Some(Communication::Writable), middleware::layer(f));
    }

    fn add_layer(&self, kind: Option<Communication>, layer: Layer) {
        self.layers.write().push(kind, layer);
    }

    pub(crate) fn layers(&self, kind: Communication) -> Vec<Layer> {
        self.layers.read().chain(kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
