//! Error types for TMCP Core.
//!
//! [`BridgeError`] carries one variant per failure the bridge can report.
//! [`ErrorKind`] is its copyable tag and [`ErrorCategory`] groups kinds into
//! the classes a caller acts on: the peer could not be reached, something
//! failed a security check, the peer did not answer in time, or the local
//! side is misconfigured.

use thiserror::Error;

use tmcp_transport::TransportKind;

use crate::store::StoreError;
use crate::types::SessionState;

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    /// The DID could not be resolved or its document is unusable.
    #[error("unresolvable DID {did}: {reason}")]
    UnresolvableDid { did: String, reason: String },

    /// The registry refused or failed to publish a document.
    #[error("publication failed: {0}")]
    PublicationFailed(String),

    /// No adapter registered for the peer's advertised transport kind.
    #[error("unsupported transport kind: {0}")]
    UnsupportedTransportKind(TransportKind),

    #[error("transport connect to {address} failed: {reason}")]
    TransportConnectFailed { address: String, reason: String },

    #[error("sealing failed: {0}")]
    SealingFailed(String),

    /// Signature, decryption or envelope structure check failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A cryptographically valid envelope came from someone other than the
    /// session's peer.
    #[error("sender mismatch: expected {expected}, got {actual}")]
    SenderMismatch { expected: String, actual: String },

    #[error("replayed envelope: sequence {sequence} (last accepted {last_accepted})")]
    ReplayedEnvelope { sequence: u64, last_accepted: u64 },

    #[error("timed out during {0}")]
    SessionTimeout(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("session closed")]
    Closed,
}

/// Copyable tag for a [`BridgeError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnresolvableDid,
    PublicationFailed,
    UnsupportedTransportKind,
    TransportConnectFailed,
    SealingFailed,
    AuthenticationFailed,
    SenderMismatch,
    ReplayedEnvelope,
    SessionTimeout,
    Store,
    Cancelled,
    InvalidState,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    PeerUnreachable,
    SecurityViolation,
    Timeout,
    Local,
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorKind::UnresolvableDid
            | ErrorKind::TransportConnectFailed
            | ErrorKind::Closed => ErrorCategory::PeerUnreachable,
            ErrorKind::AuthenticationFailed
            | ErrorKind::SenderMismatch
            | ErrorKind::ReplayedEnvelope => ErrorCategory::SecurityViolation,
            ErrorKind::SessionTimeout => ErrorCategory::Timeout,
            ErrorKind::PublicationFailed
            | ErrorKind::UnsupportedTransportKind
            | ErrorKind::SealingFailed
            | ErrorKind::Store
            | ErrorKind::Cancelled
            | ErrorKind::InvalidState => ErrorCategory::Local,
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::UnresolvableDid { .. } => ErrorKind::UnresolvableDid,
            BridgeError::PublicationFailed(_) => ErrorKind::PublicationFailed,
            BridgeError::UnsupportedTransportKind(_) => ErrorKind::UnsupportedTransportKind,
            BridgeError::TransportConnectFailed { .. } => ErrorKind::TransportConnectFailed,
            BridgeError::SealingFailed(_) => ErrorKind::SealingFailed,
            BridgeError::AuthenticationFailed(_) => ErrorKind::AuthenticationFailed,
            BridgeError::SenderMismatch { .. } => ErrorKind::SenderMismatch,
            BridgeError::ReplayedEnvelope { .. } => ErrorKind::ReplayedEnvelope,
            BridgeError::SessionTimeout(_) => ErrorKind::SessionTimeout,
            BridgeError::Store(_) => ErrorKind::Store,
            BridgeError::Cancelled => ErrorKind::Cancelled,
            BridgeError::InvalidState(_) => ErrorKind::InvalidState,
            BridgeError::Closed => ErrorKind::Closed,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Whether this error ends the session it occurred in.
    ///
    /// Replays are dropped and logged; everything else is terminal.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, BridgeError::ReplayedEnvelope { .. })
    }
}

/// Terminal error of a session: where it failed and why.
#[derive(Debug, Error, Clone)]
#[error("session failed during {state}: {error}")]
pub struct SessionFailure {
    pub state: SessionState,
    #[source]
    pub error: BridgeError,
}

impl SessionFailure {
    pub fn new(state: SessionState, error: BridgeError) -> Self {
        Self { state, error }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn category(&self) -> ErrorCategory {
        self.error.category()
    }
}
