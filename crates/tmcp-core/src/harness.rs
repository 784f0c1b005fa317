//! In-process test harness.
//!
//! [`TestWorld`] wires a memory DID registry and a [`MemoryNetwork`] shared by
//! any number of [`Node`]s, each with its own keyring, identity store,
//! resolver, sealing engine and session manager. Used by the integration
//! tests and by the CLI demo.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use tmcp_crypto::keys::KeyMaterial;
use tmcp_transport::{MemoryListener, MemoryNetwork, TransportKind};

use crate::codec::EnvelopeCodec;
use crate::config::BridgeConfig;
use crate::did::{DidDocument, DocumentDraft, MemoryDidRegistry};
use crate::engine::{LocalSealingEngine, SealingEngine};
use crate::identity::IdentityStore;
use crate::keys::Keyring;
use crate::resolver::DidResolver;
use crate::router::{HandlerError, MessageRouter, RpcHandler};
use crate::session::SessionManager;
use crate::shutdown::Shutdown;
use crate::store::InMemoryIdentityBackend;
use crate::transport::TransportRegistry;
use crate::types::{Advertisement, Identity, KeyHandle};

/// Handler that sends every message straight back.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn handle(&self, _peer_did: &str, message: Bytes) -> Result<Option<Bytes>, HandlerError> {
        Ok(Some(message))
    }
}

/// Shared registry and network.
pub struct TestWorld {
    pub registry: Arc<MemoryDidRegistry>,
    pub network: MemoryNetwork,
    pub config: BridgeConfig,
}

impl TestWorld {
    pub fn new() -> Self {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self {
            registry: Arc::new(MemoryDidRegistry::new(config.registry.clone())),
            network: MemoryNetwork::new(),
            config,
        }
    }

    /// A node with adapters for both transport kinds.
    pub fn node(&self) -> Node {
        self.node_with(&TransportKind::all())
    }

    /// A node that can only dial the given kinds.
    pub fn node_with(&self, kinds: &[TransportKind]) -> Node {
        let keyring = Arc::new(Keyring::new());
        let backend = Arc::new(InMemoryIdentityBackend::new());
        let identities = Arc::new(IdentityStore::new(
            backend.clone(),
            self.registry.clone(),
            keyring.clone(),
        ));
        let resolver = Arc::new(DidResolver::new(
            self.registry.clone(),
            self.config.resolver.freshness(),
        ));
        let engine = Arc::new(LocalSealingEngine::new(keyring));

        let mut transports = TransportRegistry::new();
        for kind in kinds {
            transports.register(Arc::new(self.network.adapter(*kind)));
        }

        let shutdown = Shutdown::new();
        let manager = Arc::new(SessionManager::new(
            identities.clone(),
            resolver.clone(),
            transports,
            engine.clone(),
            self.config.session.clone(),
            shutdown.clone(),
        ));

        Node {
            identities,
            backend,
            resolver,
            engine,
            manager,
            shutdown,
        }
    }
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Node {
    pub identities: Arc<IdentityStore>,
    pub backend: Arc<InMemoryIdentityBackend>,
    pub resolver: Arc<DidResolver>,
    pub engine: Arc<LocalSealingEngine>,
    pub manager: Arc<SessionManager>,
    pub shutdown: Shutdown,
}

impl Node {
    /// Accept every connection on `listener` as `alias` and serve it with
    /// `handler` until the listener is dropped or shutdown is triggered.
    pub fn serve(
        &self,
        alias: &str,
        listener: MemoryListener,
        handler: Arc<dyn RpcHandler>,
    ) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let alias = alias.to_string();
        let mut signal = self.shutdown.signal();
        tokio::spawn(async move {
            let router = Arc::new(MessageRouter::new(handler));
            loop {
                let incoming = tokio::select! {
                    incoming = listener.accept() => incoming,
                    _ = signal.cancelled() => break,
                };
                let Some(incoming) = incoming else { break };

                let manager = manager.clone();
                let router = router.clone();
                let alias = alias.clone();
                tokio::spawn(async move {
                    match manager.accept(&alias, incoming).await {
                        Ok((session, first)) => {
                            let session = Arc::new(session);
                            if let Err(e) = router.serve(session.clone(), first).await {
                                debug!(peer = %session.peer_did(), error = %e, "session ended with error");
                            }
                        }
                        Err(failure) => warn!(error = %failure, "rejected inbound session"),
                    }
                });
            }
        })
    }
}

/// Three envelope codecs sharing one engine: `a` seals to `b`, `b` expects
/// `a`, and `c_to_b` is a third trusted party writing to `b`.
pub struct SealingPair {
    pub a: EnvelopeCodec,
    pub b: EnvelopeCodec,
    pub c_to_b: EnvelopeCodec,
}

impl SealingPair {
    pub fn new(reorder_window: usize, max_payload_bytes: usize) -> Self {
        let keyring = Arc::new(Keyring::new());
        let engine = Arc::new(LocalSealingEngine::new(keyring.clone()));

        let a = party(&keyring, engine.as_ref(), "party-a");
        let b = party(&keyring, engine.as_ref(), "party-b");
        let c = party(&keyring, engine.as_ref(), "party-c");

        let codec = |local: &Identity, peer: &Identity| {
            EnvelopeCodec::new(
                engine.clone(),
                local.clone(),
                peer.did.clone(),
                reorder_window,
                max_payload_bytes,
            )
        };

        Self {
            a: codec(&a, &b),
            b: codec(&b, &a),
            c_to_b: codec(&c, &b),
        }
    }
}

fn party(keyring: &Keyring, engine: &LocalSealingEngine, name: &str) -> Identity {
    let key = KeyHandle(Uuid::new_v4());
    let material = KeyMaterial::generate();
    let keys = material.public_keys();
    keyring.insert(key, material);

    let did = format!("did:web:did.example.org:endpoint:{name}");
    keyring.bind_did(&key, &did);
    let advertisement = Advertisement::new(TransportKind::BidirectionalSocket, "mem+socket://harness");
    let doc = DidDocument::from_draft(
        &did,
        &DocumentDraft {
            did: None,
            name: name.to_string(),
            advertisement: advertisement.clone(),
            keys,
            version: 1,
        },
    );
    // the document is built from valid keys, so trusting it cannot fail
    let _ = engine.trust_peer(&doc);

    Identity {
        alias: name.to_string(),
        did,
        transport_kind: advertisement.kind,
        endpoint: advertisement.address,
        document_version: 1,
        key,
    }
}
