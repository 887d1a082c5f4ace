#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hive_mesh::{ConnectOptions, ListenOptions, MeshConfig, Peer, PeerEvent, Unit};
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(name: &str) -> MeshConfig {
    let mut config = MeshConfig::named(name);
    config.request_timeout = Duration::from_secs(5);
    config.auth_timeout = Duration::from_secs(2);
    config
}

pub fn peer(name: &str) -> Peer {
    Peer::new(config(name)).unwrap()
}

/// Listen on an ephemeral local port; returns the dialable address.
pub async fn listen(peer: &Peer) -> String {
    let addr = peer
        .listen(ListenOptions::new("127.0.0.1", 0))
        .await
        .unwrap();
    format!("ws://{addr}")
}

pub async fn connect_once(client: &Peer, address: &str) -> Arc<Unit> {
    tokio::time::timeout(WAIT, client.connect(address, ConnectOptions::once()))
        .await
        .expect("connect timed out")
        .expect("connect failed")
}

/// Poll `check` until it holds or the wait expires.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for the first event matching `pick`.
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<PeerEvent>,
    pick: impl Fn(PeerEvent) -> Option<T>,
) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => {
                if let Some(found) = pick(event) {
                    return found;
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(e)) => panic!("event channel failed: {e}"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}
