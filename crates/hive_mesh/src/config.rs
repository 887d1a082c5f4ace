//! Configuration for a mesh peer and its listeners/connections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Default high-water-mark of flow-controlled streams, in bytes.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// A preshared key entry used by the authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresharedKey {
    pub id: String,
    pub key: String,
}

/// Configuration for a [`Peer`](crate::Peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Human-readable name advertised to remote peers.
    pub name: String,

    /// Whether this peer takes part in service discovery ("acquaint").
    pub friendly: bool,

    /// Default timeout for requests and stream opening.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Deadline for the authentication handshake of a new socket.
    #[serde(with = "duration_ms")]
    pub auth_timeout: Duration,

    /// Interval between heartbeat pings on every bound socket.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// How long to wait for a pong before dropping the socket.
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// Timeout for establishing an outbound WebSocket connection.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Credit (in bytes) granted to the writer of a flow-controlled stream.
    pub stream_high_water_mark: usize,

    /// Delays between reconnection attempts; the last entry repeats.
    #[serde(with = "duration_ms_list")]
    pub reconnect_schedule: Vec<Duration>,

    /// Keys loaded into the peer's keyring at construction.
    pub preshared_keys: Vec<PresharedKey>,

    /// Static tags advertised to remote peers.
    pub tags: BTreeMap<String, String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            friendly: true,
            request_timeout: Duration::from_secs(5 * 60),
            auth_timeout: Duration::from_millis(4000),
            heartbeat_interval: Duration::from_millis(5000),
            heartbeat_timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_secs(10),
            stream_high_water_mark: DEFAULT_HIGH_WATER_MARK,
            reconnect_schedule: [0, 1, 2, 3, 4, 5, 10, 30, 60]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            preshared_keys: Vec::new(),
            tags: BTreeMap::new(),
        }
    }
}

impl MeshConfig {
    /// Config with the given display name and defaults for everything else.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Check the values that would otherwise break the runtime.
    pub fn validate(&self) -> Result<()> {
        if self.stream_high_water_mark == 0 {
            return Err(MeshError::Config(
                "stream_high_water_mark must be positive".into(),
            ));
        }
        if self.reconnect_schedule.is_empty() {
            return Err(MeshError::Config(
                "reconnect_schedule must have at least one entry".into(),
            ));
        }
        if self.heartbeat_timeout >= self.heartbeat_interval {
            return Err(MeshError::Config(format!(
                "heartbeat_timeout ({:?}) must be shorter than heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }

    /// Delay before the reconnection attempt with the given index.
    pub fn reconnect_delay(&self, attempt: usize) -> Duration {
        self.reconnect_schedule
            .get(attempt)
            .or_else(|| self.reconnect_schedule.last())
            .copied()
            .unwrap_or_default()
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> std::result::Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<MeshConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

/// PEM-encoded certificate chain and PKCS#8 private key for a TLS listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where and how [`Peer::listen`](crate::Peer::listen) accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenOptions {
    pub host: String,
    /// Port to bind; `0` picks a free one.
    pub port: u16,
    /// Only upgrade requests for this path when set.
    pub path: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl ListenOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: None,
            tls: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsConfig {
            cert: cert.into(),
            key: key.into(),
        });
        self
    }
}

impl From<u16> for ListenOptions {
    fn from(port: u16) -> Self {
        Self::new("0.0.0.0", port)
    }
}

/// Options for [`Peer::connect`](crate::Peer::connect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Keep reconnecting until the resulting unit is closed explicitly.
    pub permanent: bool,
    /// Skip certificate verification for `wss://` addresses.
    pub accept_invalid_certs: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            permanent: true,
            accept_invalid_certs: false,
        }
    }
}

impl ConnectOptions {
    /// A single connection attempt without reconnection.
    pub fn once() -> Self {
        Self {
            permanent: false,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

mod duration_ms_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(list: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(list.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(d)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.friendly);
        assert_eq!(config.request_timeout, Duration::from_secs(300));
        assert_eq!(config.auth_timeout, Duration::from_millis(4000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(2000));
        assert_eq!(config.stream_high_water_mark, 16384);
        assert_eq!(config.reconnect_schedule.len(), 9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let config = MeshConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::ZERO);
        assert_eq!(config.reconnect_delay(6), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(8), Duration::from_secs(60));
        assert_eq!(config.reconnect_delay(500), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = MeshConfig::default();
        config.stream_high_water_mark = 0;
        assert!(matches!(config.validate(), Err(MeshError::Config(_))));

        let mut config = MeshConfig::default();
        config.reconnect_schedule.clear();
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.heartbeat_timeout = config.heartbeat_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig =
            serde_json::from_str(r#"{"name": "edge", "auth_timeout": 250}"#).unwrap();
        assert_eq!(config.name, "edge");
        assert_eq!(config.auth_timeout, Duration::from_millis(250));
        assert!(config.friendly);
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5000));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mesh.json");

        let mut original = MeshConfig::named("saved");
        original.friendly = false;
        original.preshared_keys.push(PresharedKey {
            id: "foo".into(),
            key: "bar".into(),
        });
        original.reconnect_schedule = vec![Duration::from_millis(150)];
        original.save_to_file(&path).unwrap();

        let loaded = MeshConfig::load_or_default(&path);
        assert_eq!(loaded.name, "saved");
        assert!(!loaded.friendly);
        assert_eq!(loaded.preshared_keys, original.preshared_keys);
        assert_eq!(loaded.reconnect_schedule, vec![Duration::from_millis(150)]);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mesh.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = MeshConfig::load_or_default(&path);
        assert!(config.name.is_empty());
        assert_eq!(config.stream_high_water_mark, DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_listen_options_from_port() {
        let options = ListenOptions::from(9000).with_path("/mesh");
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.port, 9000);
        assert_eq!(options.path.as_deref(), Some("/mesh"));
        assert!(options.tls.is_none());
    }

    #[test]
    fn test_connect_options_defaults() {
        assert!(ConnectOptions::default().permanent);
        assert!(!ConnectOptions::default().accept_invalid_certs);
        assert!(!ConnectOptions::once().permanent);
    }
}
