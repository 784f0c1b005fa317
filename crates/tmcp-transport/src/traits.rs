//! Transport adapter contract.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::framing::FramingError;

/// Transport kind advertised in a DID document's service endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Server push stream (SSE) with a separate upstream channel.
    PushStream,
    /// Full-duplex socket (WebSocket).
    BidirectionalSocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::PushStream => "push-stream",
            TransportKind::BidirectionalSocket => "bidirectional-socket",
        }
    }

    /// Kind implied by an endpoint URI scheme, if any.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "sse" | "sses" | "mem+push" => Some(TransportKind::PushStream),
            "ws" | "wss" | "mem+socket" => Some(TransportKind::BidirectionalSocket),
            _ => None,
        }
    }

    pub fn all() -> [TransportKind; 2] {
        [TransportKind::PushStream, TransportKind::BidirectionalSocket]
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push-stream" | "sse" => Ok(TransportKind::PushStream),
            "bidirectional-socket" | "websocket" | "ws" => Ok(TransportKind::BidirectionalSocket),
            other => Err(TransportError::UnknownKind(other.to_string())),
        }
    }
}

/// An open connection to one peer.
///
/// `receive` suspends until an envelope arrives. A closed connection, from
/// either side, is reported as [`TransportError::Closed`], never as an empty
/// payload.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn peer_address(&self) -> &str;

    async fn send(&self, envelope: Bytes) -> Result<(), TransportError>;

    async fn receive(&self) -> Result<Bytes, TransportError>;

    /// Close the connection. Wakes any pending `receive`. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Factory for connections of one transport kind.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self, address: &str) -> Result<Arc<dyn TransportHandle>, TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unknown transport kind: {0}")]
    UnknownKind(String),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
