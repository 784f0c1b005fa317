//! Shared types for TMCP Core.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tmcp_transport::TransportKind;

use crate::did::DidDocument;

/// Opaque reference to key material held by the [`Keyring`](crate::keys::Keyring).
///
/// Handles are cheap to copy and carry no secret; the keys they refer to
/// never leave the keyring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(pub Uuid);

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", self.0.simple())
    }
}

/// What a local identity advertises in its DID document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub kind: TransportKind,
    /// Endpoint address. Clients that only dial out advertise a placeholder
    /// such as `tmcpclient://`.
    pub address: String,
}

impl Advertisement {
    pub fn new(kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
        }
    }
}

/// A published local identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub alias: String,
    pub did: String,
    pub transport_kind: TransportKind,
    pub endpoint: String,
    pub document_version: u64,
    pub key: KeyHandle,
}

/// A resolved peer DID document, reduced to what session setup needs.
#[derive(Clone, Debug)]
pub struct PeerDocument {
    pub did: String,
    pub transport_kind: TransportKind,
    pub endpoint_address: String,
    pub document_version: u64,
    pub fetched_at: DateTime<Utc>,
    /// The full document, including fields the bridge does not interpret.
    pub document: DidDocument,
}

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Resolving,
    TransportConnecting,
    Handshaking,
    Active,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Resolving => "resolving",
            SessionState::TransportConnecting => "transport_connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
