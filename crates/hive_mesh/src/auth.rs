//! Mutual preshared-key handshake run on every new socket.
//!
//! Both sides run the same state machine. A side holding keys opens with a
//! CHALLENGE carrying a random nonce and its key ids; a side without keys
//! confirms right away. A side is done once it has *proved* itself (the
//! remote sent CONFIRMED) and has *confirmed* the remote (its RESPONSE
//! carried a valid HMAC of our nonce, or we hold no keys).

use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::PresharedKey;
use crate::error::{MeshError, Result};
use crate::identity::IdentityPayload;
use crate::transport::Socket;

type HmacSha256 = Hmac<Sha256>;

/// Handshake frame tags.
pub mod auth_tag {
    pub const ERROR: u8 = 0;
    pub const CHALLENGE: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const CONFIRMED: u8 = 3;
}

/// One handshake frame: tag byte followed by JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthFrame {
    Error(String),
    Challenge(Challenge),
    Response(Proof),
    Confirmed(IdentityPayload),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub proof: String,
    pub id: String,
}

impl AuthFrame {
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        match self {
            Self::Error(message) => {
                out.put_u8(auth_tag::ERROR);
                out.put_slice(&serde_json::to_vec(message)?);
            }
            Self::Challenge(challenge) => {
                out.put_u8(auth_tag::CHALLENGE);
                out.put_slice(&serde_json::to_vec(challenge)?);
            }
            Self::Response(proof) => {
                out.put_u8(auth_tag::RESPONSE);
                out.put_slice(&serde_json::to_vec(proof)?);
            }
            Self::Confirmed(identity) => {
                out.put_u8(auth_tag::CONFIRMED);
                out.put_slice(&serde_json::to_vec(identity)?);
            }
        }
        Ok(out.freeze())
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        let Some((&tag, json)) = bytes.split_first() else {
            return Err("empty handshake frame".to_string());
        };
        let malformed = |e: serde_json::Error| format!("malformed handshake frame {tag}: {e}");
        match tag {
            auth_tag::ERROR => {
                // A bare string is expected, anything else is shown as-is.
                let message = serde_json::from_slice::<String>(json)
                    .unwrap_or_else(|_| String::from_utf8_lossy(json).into_owned());
                Ok(Self::Error(message))
            }
            auth_tag::CHALLENGE => serde_json::from_slice(json)
                .map(Self::Challenge)
                .map_err(malformed),
            auth_tag::RESPONSE => serde_json::from_slice(json)
                .map(Self::Response)
                .map_err(malformed),
            auth_tag::CONFIRMED => serde_json::from_slice(json)
                .map(Self::Confirmed)
                .map_err(malformed),
            other => Err(format!("unknown handshake frame {other}")),
        }
    }
}

/// Hex HMAC-SHA256 of `challenge` under `key`.
pub fn sign(key: &str, challenge: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(challenge.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a proof produced by [`sign`].
pub fn verify(key: &str, challenge: &str, proof: &str) -> bool {
    let expected = sign(key, challenge);
    expected.as_bytes().ct_eq(proof.as_bytes()).into()
}

/// Preshared keys of a peer, in insertion order.
#[derive(Debug, Default)]
pub struct Keyring {
    keys: RwLock<Vec<PresharedKey>>,
}

impl Keyring {
    pub fn new(keys: impl IntoIterator<Item = PresharedKey>) -> Self {
        let ring = Self::default();
        for key in keys {
            ring.insert(key.id, key.key);
        }
        ring
    }

    /// Add a key, replacing the key of an existing id in place.
    pub fn insert(&self, id: impl Into<String>, key: impl Into<String>) {
        let (id, key) = (id.into(), key.into());
        let mut keys = self.keys.write();
        match keys.iter_mut().find(|k| k.id == id) {
            Some(existing) => existing.key = key,
            None => keys.push(PresharedKey { id, key }),
        }
    }

    pub fn snapshot(&self) -> Vec<PresharedKey> {
        self.keys.read().clone()
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

/// Why a handshake ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// We refuse the remote; an ERROR frame must be sent.
    Local(String),
    /// The remote refused us with an ERROR frame.
    Remote(String),
}

/// Handshake state for one socket.
pub(crate) struct Handshake {
    keys: Vec<PresharedKey>,
    nonce: String,
    identity: IdentityPayload,
    proved: bool,
    confirmed: bool,
    challenge_received: bool,
    remote: Option<IdentityPayload>,
}

impl Handshake {
    pub fn new(keys: Vec<PresharedKey>, identity: IdentityPayload) -> Self {
        let nonce: [u8; 32] = rand::random();
        Self {
            keys,
            nonce: hex::encode(nonce),
            identity,
            proved: false,
            confirmed: false,
            challenge_received: false,
            remote: None,
        }
    }

    /// The first frame to send once the socket is open.
    pub fn opening(&mut self) -> AuthFrame {
        if self.keys.is_empty() {
            self.confirmed = true;
            AuthFrame::Confirmed(self.identity.clone())
        } else {
            AuthFrame::Challenge(Challenge {
                challenge: self.nonce.clone(),
                ids: self.keys.iter().map(|k| k.id.clone()).collect(),
            })
        }
    }

    /// Feed one received frame; returns the frame to answer with, if any.
    pub fn receive(&mut self, bytes: &[u8]) -> std::result::Result<Option<AuthFrame>, Rejection> {
        let frame = AuthFrame::decode(bytes).map_err(Rejection::Local)?;
        match frame {
            AuthFrame::Error(message) => Err(Rejection::Remote(message)),
            AuthFrame::Challenge(challenge) => {
                self.challenge_received = true;
                let key = challenge
                    .ids
                    .iter()
                    .find_map(|id| self.keys.iter().find(|k| &k.id == id))
                    .ok_or_else(|| {
                        Rejection::Local(format!(
                            "none of the offered key ids {:?} is known",
                            challenge.ids
                        ))
                    })?;
                Ok(Some(AuthFrame::Response(Proof {
                    proof: sign(&key.key, &challenge.challenge),
                    id: key.id.clone(),
                })))
            }
            AuthFrame::Response(proof) => {
                let key = self
                    .keys
                    .iter()
                    .find(|k| k.id == proof.id)
                    .ok_or_else(|| Rejection::Local(format!("unknown key id {:?}", proof.id)))?;
                if !verify(&key.key, &self.nonce, &proof.proof) {
                    return Err(Rejection::Local(format!(
                        "proof for key id {:?} does not match",
                        proof.id
                    )));
                }
                self.confirmed = true;
                Ok(Some(AuthFrame::Confirmed(self.identity.clone())))
            }
            AuthFrame::Confirmed(remote) => {
                self.proved = true;
                self.remote = Some(remote);
                Ok(None)
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.proved && self.confirmed
    }

    pub fn progress(&self) -> String {
        format!(
            "proved: {}, confirmed: {}, challenge received: {}",
            self.proved, self.confirmed, self.challenge_received
        )
    }

    pub fn into_remote(self) -> Option<IdentityPayload> {
        self.remote
    }
}

/// Run the handshake on a freshly attached socket.
pub(crate) async fn authenticate(
    socket: &Socket,
    inbound: &mut mpsc::UnboundedReceiver<Bytes>,
    keys: Vec<PresharedKey>,
    identity: IdentityPayload,
    timeout: std::time::Duration,
) -> Result<IdentityPayload> {
    let mut handshake = Handshake::new(keys, identity);
    socket.send(handshake.opening().encode()?).await?;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    while !handshake.is_done() {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(bytes) = frame else {
                    return Err(MeshError::Auth(format!(
                        "socket closed during handshake ({})",
                        handshake.progress()
                    )));
                };
                match handshake.receive(&bytes) {
                    Ok(Some(reply)) => socket.send(reply.encode()?).await?,
                    Ok(None) => {}
                    Err(Rejection::Local(message)) => {
                        warn!("Rejecting handshake on socket {}: {message}", socket.id());
                        socket.enqueue(AuthFrame::Error(message.clone()).encode()?);
                        return Err(MeshError::Auth(format!("Verification error: {message}")));
                    }
                    Err(Rejection::Remote(message)) => {
                        return Err(MeshError::Auth(format!("Rejected by remote: {message}")));
                    }
                }
            }
            _ = &mut deadline => {
                let message = format!("Authentication time elapsed. {}", handshake.progress());
                socket.enqueue(AuthFrame::Error(message.clone()).encode()?);
                return Err(MeshError::Auth(message));
            }
        }
    }

    debug!("Handshake on socket {} complete", socket.id());
    handshake
        .into_remote()
        .ok_or_else(|| MeshError::Auth("handshake finished without remote identity".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
