//! Outbound gateway to one remote role.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::{BoxStream, FuturesUnordered};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::context::Response;
use crate::error::{MeshError, Result};
use crate::events::DestinationEvent;
use crate::peer::PeerInner;
use crate::protocol::Payload;
use crate::round_robin::RoundRobinSet;
use crate::stream::{StreamReader, StreamWriter};
use crate::unit::Unit;

/// Event name, timeout and unit selection of one outgoing call.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub event: String,
    /// Overrides the peer's request timeout.
    pub timeout: Option<Duration>,
    /// Call this unit instead of the next one in rotation.
    pub unit: Option<Arc<Unit>>,
}

impl EmitOptions {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn to_unit(mut self, unit: Arc<Unit>) -> Self {
        self.unit = Some(unit);
        self
    }
}

impl From<&str> for EmitOptions {
    fn from(event: &str) -> Self {
        Self::new(event)
    }
}

impl From<String> for EmitOptions {
    fn from(event: String) -> Self {
        Self::new(event)
    }
}

/// The units serving one role, picked in rotation.
pub struct Destination {
    name: String,
    peer: Weak<PeerInner>,
    units: Mutex<RoundRobinSet<Arc<Unit>>>,
    ready: watch::Sender<bool>,
    events: broadcast::Sender<DestinationEvent>,
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("units", &self.units.lock().len())
            .finish()
    }
}

impl Destination {
    pub(crate) fn new(name: String, peer: Weak<PeerInner>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name,
            peer,
            units: Mutex::new(RoundRobinSet::new()),
            ready: watch::Sender::new(false),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether at least one unit serves this role.
    pub fn ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.lock().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DestinationEvent> {
        self.events.subscribe()
    }

    /// Wait until a unit serves this role.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|ready| *ready))
            .await
            .map_err(|_| MeshError::Timeout(timeout))?
            .map_err(|_| MeshError::NoUnits(self.name.clone()))?;
        Ok(())
    }

    // -- Membership ---------------------------------------------------------

    pub(crate) fn add_unit(&self, unit: &Arc<Unit>) {
        let first = {
            let mut units = self.units.lock();
            if !units.insert(Arc::clone(unit)) {
                return;
            }
            units.len() == 1
        };
        debug!("Unit {} joined destination \"{}\"", unit.id(), self.name);
        if first {
            self.ready.send_replace(true);
            let _ = self.events.send(DestinationEvent::Ready);
        }
        let _ = self.events.send(DestinationEvent::UnitAdded(Arc::clone(unit)));
    }

    pub(crate) fn remove_unit(&self, unit: &Arc<Unit>) {
        let empty = {
            let mut units = self.units.lock();
            if !units.remove(unit) {
                return;
            }
            units.is_empty()
        };
        debug!("Unit {} left destination \"{}\"", unit.id(), self.name);
        let _ = self.events.send(DestinationEvent::UnitRemoved(unit.id().clone()));
        if empty {
            self.ready.send_replace(false);
            let _ = self.events.send(DestinationEvent::Empty);
        }
    }

    /// The unit for a single call: the targeted one or the next in rotation.
    fn pick(&self, options: &EmitOptions) -> Result<Arc<Unit>> {
        let unit = match &options.unit {
            Some(unit) => self
                .peer
                .upgrade()
                .and_then(|peer| peer.connected_unit(unit.id()))
                .filter(|connected| Arc::ptr_eq(connected, unit)),
            None => self.units.lock().next(),
        };
        unit.ok_or_else(|| MeshError::NoUnits(self.name.clone()))
    }

    // -- Calls --------------------------------------------------------------

    /// Fire-and-forget message to one unit. Returns the unit it went to, or
    /// `None` when no unit serves the role (or the targeted one is gone).
    pub fn send(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> Option<Arc<Unit>> {
        let options = options.into();
        let unit = self.pick(&options).ok()?;
        let target = Arc::clone(&unit);
        let role = self.name.clone();
        let data = data.into();
        tokio::spawn(async move {
            if let Err(e) = target.send_message(&role, &options.event, data).await {
                debug!("Message \"{}\" to unit {} not sent: {e}", options.event, target.id());
            }
        });
        Some(unit)
    }

    /// Like [`send`](Self::send) but waits until the frame was written.
    pub async fn send_confirmed(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> Result<Arc<Unit>> {
        let options = options.into();
        let unit = self.pick(&options)?;
        unit.send_message(&self.name, &options.event, data.into())
            .await?;
        Ok(unit)
    }

    /// Message every unit serving the role. Returns how many were addressed.
    pub fn broadcast(&self, options: impl Into<EmitOptions>, data: impl Into<Payload>) -> usize {
        let options = options.into();
        let data = data.into();
        let units = self.units();
        for unit in &units {
            let unit = Arc::clone(unit);
            let role = self.name.clone();
            let event = options.event.clone();
            let data = data.clone();
            tokio::spawn(async move {
                if let Err(e) = unit.send_message(&role, &event, data).await {
                    debug!("Broadcast \"{event}\" to unit {} not sent: {e}", unit.id());
                }
            });
        }
        units.len()
    }

    pub async fn request(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> Result<Response> {
        let options = options.into();
        let unit = self.pick(&options)?;
        unit.request(&self.name, &options.event, data.into(), options.timeout)
            .await
    }

    /// Request every unit serving the role; replies arrive as they come.
    pub fn survey(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> BoxStream<'static, Result<Response>> {
        let options = options.into();
        let data = data.into();
        let calls: FuturesUnordered<_> = self
            .units()
            .into_iter()
            .map(|unit| {
                let role = self.name.clone();
                let event = options.event.clone();
                let data = data.clone();
                let timeout = options.timeout;
                async move { unit.request(&role, &event, data, timeout).await }
            })
            .collect();
        calls.boxed()
    }

    /// Open a stream the remote handler writes into.
    pub async fn readable(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> Result<StreamReader> {
        let options = options.into();
        let unit = self.pick(&options)?;
        unit.open_readable(&self.name, &options.event, data.into(), options.timeout)
            .await
    }

    /// Open a stream the remote handler reads from.
    pub async fn writable(
        &self,
        options: impl Into<EmitOptions>,
        data: impl Into<Payload>,
    ) -> Result<StreamWriter> {
        let options = options.into();
        let unit = self.pick(&options)?;
        unit.open_writable(&self.name, &options.event, data.into(), options.timeout)
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> Destination {
        Destination::new("files".into(), Weak::new())
    }

    #[tokio::test]
    async fn test_ready_follows_membership_edges() {
        let dest = destination();
        let mut events = dest.subscribe();
        let a = Unit::detached("a");
        let b = Unit::detached("b");

        dest.add_unit(&a);
        dest.add_unit(&a);
        dest.add_unit(&b);
        assert!(dest.ready());
        assert_eq!(dest.units().len(), 2);

        dest.remove_unit(&a);
        assert!(dest.ready());
        dest.remove_unit(&b);
        assert!(!dest.ready());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(match event {
                DestinationEvent::Ready => "ready",
                DestinationEvent::UnitAdded(_) => "added",
                DestinationEvent::UnitRemoved(_) => "removed",
                DestinationEvent::Empty => "empty",
            });
        }
        assert_eq!(seen, vec!["ready", "added", "added", "removed", "removed", "empty"]);
    }

    #[tokio::test]
    async fn test_calls_without_units_fail() {
        let dest = destination();
        assert!(dest.send("ping", ()).is_none());
        assert_eq!(dest.broadcast("ping", ()), 0);
        assert!(matches!(
            dest.request("ping", ()).await,
            Err(MeshError::NoUnits(name)) if name == "files"
        ));
        assert!(matches!(
            dest.send_confirmed("ping", ()).await,
            Err(MeshError::NoUnits(_))
        ));
        assert!(dest.survey("ping", ()).next().await.is_none());
    }

    #[tokio::test]
    async fn test_targeted_calls_need_a_connected_unit() {
        let dest = destination();
        let member = Unit::detached("member");
        dest.add_unit(&member);

        // Membership alone is not enough: the unit must belong to a live peer.
        let target = || EmitOptions::new("e").to_unit(Arc::clone(&member));
        assert!(dest.send(target(), ()).is_none());
        assert!(matches!(
            dest.send_confirmed(target(), ()).await,
            Err(MeshError::NoUnits(_))
        ));
        assert!(matches!(
            dest.request(target(), ()).await,
            Err(MeshError::NoUnits(_))
        ));
        assert!(dest.send("e", ()).is_some());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let dest = destination();
        let result = dest.wait_ready(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(MeshError::Timeout(_))));

        dest.add_unit(&Unit::detached("a"));
        dest.wait_ready(Duration::from_millis(20)).await.unwrap();
    }

    #[test]
    fn test_emit_options_from_str() {
        let options: EmitOptions = "upload".into();
        assert_eq!(options.event, "upload");
        assert!(options.timeout.is_none());
        assert!(options.unit.is_none());
    }
}
