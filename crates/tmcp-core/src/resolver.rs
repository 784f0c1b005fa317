//! Caching DID resolver.
//!
//! Resolved peer documents are cached for a freshness window. Each DID has
//! its own slot guarded by an async mutex: concurrent resolutions of the
//! same DID queue on that slot and the first one fetches, while different
//! DIDs never contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::did::{DidRegistry, RegistryError};
use crate::errors::BridgeError;
use crate::types::PeerDocument;

struct CachedDocument {
    peer: PeerDocument,
    stored_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedDocument>>>;

pub struct DidResolver {
    registry: Arc<dyn DidRegistry>,
    freshness: Duration,
    cache: DashMap<String, Slot>,
    fetches: AtomicU64,
}

impl DidResolver {
    pub fn new(registry: Arc<dyn DidRegistry>, freshness: Duration) -> Self {
        Self {
            registry,
            freshness,
            cache: DashMap::new(),
            fetches: AtomicU64::new(0),
        }
    }

    /// Resolve `did` to its peer document, from cache when fresh.
    pub async fn resolve(&self, did: &str) -> Result<PeerDocument, BridgeError> {
        let slot = self.cache.entry(did.to_string()).or_default().clone();
        let mut cached = slot.lock().await;

        if let Some(entry) = cached.as_ref() {
            if entry.stored_at.elapsed() < self.freshness {
                debug!(%did, "peer document cache hit");
                return Ok(entry.peer.clone());
            }
            debug!(%did, "peer document expired");
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let peer = match self.fetch(did).await {
            Ok(peer) => peer,
            Err(e) => {
                *cached = None;
                drop(cached);
                // failed DIDs leave no slot behind
                self.cache.remove_if(did, |_, current| Arc::ptr_eq(current, &slot));
                return Err(e);
            }
        };
        debug!(
            %did,
            kind = %peer.transport_kind,
            address = %peer.endpoint_address,
            version = peer.document_version,
            "peer document resolved"
        );
        *cached = Some(CachedDocument {
            peer: peer.clone(),
            stored_at: Instant::now(),
        });
        Ok(peer)
    }

    /// Drop the cached document for `did` so the next `resolve` fetches.
    pub fn invalidate(&self, did: &str) {
        if self.cache.remove(did).is_some() {
            debug!(%did, "peer document invalidated");
        }
    }

    /// Number of registry fetches performed.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fetch(&self, did: &str) -> Result<PeerDocument, BridgeError> {
        let unresolvable = |reason: String| BridgeError::UnresolvableDid {
            did: did.to_string(),
            reason,
        };

        let document = self.registry.resolve(did).await.map_err(|e| {
            warn!(%did, error = %e, "DID resolution failed");
            match e {
                RegistryError::NotFound(_) => unresolvable("not found".into()),
                other => unresolvable(other.to_string()),
            }
        })?;

        if document.id != did {
            return Err(unresolvable(format!("document is for {}", document.id)));
        }
        let (kind, address) = document.endpoint().map_err(|reason| {
            warn!(%did, %reason, "malformed peer document");
            unresolvable(reason)
        })?;

        Ok(PeerDocument {
            did: did.to_string(),
            transport_kind: kind,
            endpoint_address: address.to_string(),
            document_version: document.version,
            fetched_at: Utc::now(),
            document,
        })
    }
}
