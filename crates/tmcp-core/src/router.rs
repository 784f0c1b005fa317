//! Message router for the RPC protocol carried over a session.
//!
//! The router pulls opened messages off a [`Session`] in delivery order,
//! hands each one to an [`RpcHandler`] together with the verified peer DID,
//! and seals any response back to the peer. Server-initiated notifications
//! go out through a [`Notifier`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::errors::BridgeError;
use crate::session::Session;

// ============================================================================
// Handler
// ============================================================================

#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Protocol-side handler for opened messages.
///
/// The payload is the plaintext RPC message; its format is the protocol's
/// business. Returning `Ok(Some(response))` seals the response back to the
/// peer, `Ok(None)` sends nothing.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, peer_did: &str, message: Bytes) -> Result<Option<Bytes>, HandlerError>;
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct RouterStats {
    /// Messages taken from sessions
    pub received: AtomicU64,
    /// Messages the handler accepted
    pub dispatched: AtomicU64,
    /// Responses sealed back to peers
    pub responded: AtomicU64,
    pub handler_errors: AtomicU64,
    /// Notifications pushed by the server side
    pub notifications: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub responded: u64,
    pub handler_errors: u64,
    pub notifications: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterStatsSnapshot {
        RouterStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responded: self.responded.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Notifier
// ============================================================================

/// Sends unsolicited messages to the peer of one session.
///
/// Holds the session weakly, so a notifier kept around after the session
/// is gone just reports [`BridgeError::Closed`].
#[derive(Clone)]
pub struct Notifier {
    session: Weak<Session>,
    stats: Arc<RouterStats>,
}

impl Notifier {
    pub async fn notify(&self, message: &[u8]) -> Result<(), BridgeError> {
        let session = self.session.upgrade().ok_or(BridgeError::Closed)?;
        session.send(message).await?;
        RouterStats::inc(&self.stats.notifications);
        Ok(())
    }

    pub fn peer_did(&self) -> Option<String> {
        self.session.upgrade().map(|s| s.peer_did().to_string())
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct MessageRouter {
    handler: Arc<dyn RpcHandler>,
    stats: Arc<RouterStats>,
}

impl MessageRouter {
    pub fn new(handler: Arc<dyn RpcHandler>) -> Self {
        Self {
            handler,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    pub fn notifier(&self, session: &Arc<Session>) -> Notifier {
        Notifier {
            session: Arc::downgrade(session),
            stats: self.stats.clone(),
        }
    }

    /// Serve `session` until it ends.
    ///
    /// `first` is the message the session was established with (the caller's
    /// handshake on the accepting side). A peer close ends serving with
    /// `Ok(())`; any other terminal session error is returned.
    pub async fn serve(&self, session: Arc<Session>, first: Bytes) -> Result<(), BridgeError> {
        let peer = session.peer_did().to_string();
        info!(session = %session.id(), %peer, "serving session");

        let mut next = Some(first);
        loop {
            let message = match next.take() {
                Some(message) => message,
                None => match session.recv().await {
                    Ok(message) => message,
                    Err(BridgeError::Closed) => {
                        debug!(session = %session.id(), "session closed, router done");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };
            self.route(&session, &peer, message).await?;
        }
    }

    async fn route(&self, session: &Session, peer: &str, message: Bytes) -> Result<(), BridgeError> {
        RouterStats::inc(&self.stats.received);
        let len = message.len();

        match self.handler.handle(peer, message).await {
            Ok(response) => {
                RouterStats::inc(&self.stats.dispatched);
                debug!(%peer, len, "message dispatched");
                if let Some(response) = response {
                    session.send(&response).await?;
                    RouterStats::inc(&self.stats.responded);
                }
                Ok(())
            }
            Err(e) => {
                RouterStats::inc(&self.stats.handler_errors);
                warn!(%peer, error = %e, "handler error");
                Ok(())
            }
        }
    }
}
