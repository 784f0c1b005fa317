//! Integration tests for identity lifecycle, transport selection, stale
//! addresses and security failures.

use std::sync::Arc;
use std::time::Duration;

use tmcp_core::codec::EnvelopeCodec;
use tmcp_core::config::BridgeConfig;
use tmcp_core::did::DidRegistry;
use tmcp_core::errors::{BridgeError, ErrorCategory};
use tmcp_core::harness::{EchoHandler, Node, TestWorld};
use tmcp_core::types::{Advertisement, Identity, SessionState};
use tmcp_transport::{with_caller_did, TransportAdapter, TransportHandle, TransportKind};

const SOCKET_ADDR: &str = "mem+socket://demo-server/ws";

async fn identity(node: &Node, alias: &str, kind: TransportKind, address: &str) -> Identity {
    node.identities
        .load_or_create(alias, &Advertisement::new(kind, address))
        .await
        .expect("identity")
}

/// Trust the published document for `did` on `node`, as resolution does.
async fn trust(node: &Node, did: &str) {
    use tmcp_core::engine::SealingEngine;
    let doc = node.resolver.resolve(did).await.unwrap();
    node.engine.trust_peer(&doc.document).unwrap();
}

async fn client(world: &TestWorld) -> (Node, Identity) {
    let node = world.node();
    let id = identity(&node, "demo-client", TransportKind::PushStream, "tmcpclient://").await;
    (node, id)
}

// ============================================================================
// Identity lifecycle
// ============================================================================

#[tokio::test]
async fn integration_kind_change_yields_new_did() {
    let world = TestWorld::new();
    let node = world.node();

    let d1 = identity(&node, "demo-server", TransportKind::PushStream, "sse://localhost:8000/sse").await;
    let d2 = identity(&node, "demo-server", TransportKind::BidirectionalSocket, "wss://localhost:8000/ws").await;
    assert_ne!(d1.did, d2.did);
    assert_eq!(d2.transport_kind, TransportKind::BidirectionalSocket);

    // D1's document was never touched
    let history = world.registry.history(&d1.did);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].endpoint().unwrap().0, TransportKind::PushStream);

    let doc2 = world.registry.resolve(&d2.did).await.unwrap();
    assert_eq!(doc2.endpoint().unwrap(), (TransportKind::BidirectionalSocket, "wss://localhost:8000/ws"));

    // the alias now maps to D2, D1 is retired but kept
    assert_eq!(node.identities.get("demo-server").await.unwrap().unwrap().did, d2.did);
    let all = node.identities.list().await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|i| i.did.as_deref() == Some(d1.did.as_str()) && i.retired_at.is_some()));
}

#[tokio::test]
async fn integration_publication_failure_surfaces() {
    let world = TestWorld::new();
    let node = world.node();
    world.registry.set_offline(true);
    let err = node
        .identities
        .load_or_create("demo-server", &Advertisement::new(TransportKind::PushStream, "sse://h/sse"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::PublicationFailed(_)));
}

// ============================================================================
// Transport selection
// ============================================================================

#[tokio::test]
async fn integration_socket_document_selects_socket_adapter() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    server.serve("demo-server", world.network.listen(SOCKET_ADDR).unwrap(), Arc::new(EchoHandler));

    let (client, _) = client(&world).await;
    let (session, _) = client.manager.connect("demo-client", &server_id.did, b"init").await.unwrap();
    assert_eq!(session.transport_kind(), TransportKind::BidirectionalSocket);
}

#[tokio::test]
async fn integration_missing_adapter_is_unsupported() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let _listener = world.network.listen(SOCKET_ADDR).unwrap();

    let client = world.node_with(&[TransportKind::PushStream]);
    identity(&client, "demo-client", TransportKind::PushStream, "tmcpclient://").await;

    let failure = client
        .manager
        .connect("demo-client", &server_id.did, b"init")
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        BridgeError::UnsupportedTransportKind(TransportKind::BidirectionalSocket)
    ));
    assert_eq!(failure.state, SessionState::TransportConnecting);
    // never fell back to the push-stream adapter
    assert_eq!(world.network.connect_attempts(), 0);
}

// ============================================================================
// Resolution and stale addresses
// ============================================================================

#[tokio::test]
async fn integration_unresolvable_peer() {
    let world = TestWorld::new();
    let (client, _) = client(&world).await;
    let failure = client
        .manager
        .connect("demo-client", "did:web:did.teaspoon.world:endpoint:nobody", b"init")
        .await
        .unwrap_err();
    assert!(matches!(failure.error, BridgeError::UnresolvableDid { .. }));
    assert_eq!(failure.state, SessionState::Resolving);
    assert_eq!(failure.category(), ErrorCategory::PeerUnreachable);
}

#[tokio::test]
async fn integration_stale_address_retried_once() {
    let world = TestWorld::new();
    let server = world.node();
    let old = "mem+socket://old-host/ws";
    let new = "mem+socket://new-host/ws";
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, old).await;

    let (client, _) = client(&world).await;
    // warm the cache with the old address
    let cached = client.resolver.resolve(&server_id.did).await.unwrap();
    assert_eq!(cached.endpoint_address, old);

    // the server moves; its DID stays the same
    let moved = identity(&server, "demo-server", TransportKind::BidirectionalSocket, new).await;
    assert_eq!(moved.did, server_id.did);
    server.serve("demo-server", world.network.listen(new).unwrap(), Arc::new(EchoHandler));

    let (session, reply) = client
        .manager
        .connect("demo-client", &server_id.did, b"init")
        .await
        .unwrap();
    assert_eq!(&reply[..], b"init");
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(world.network.connect_attempts(), 2);
    assert_eq!(client.resolver.fetch_count(), 2);
}

#[tokio::test]
async fn integration_second_connect_failure_is_fatal() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    // nobody listens

    let (client, _) = client(&world).await;
    let failure = client
        .manager
        .connect("demo-client", &server_id.did, b"init")
        .await
        .unwrap_err();
    assert!(matches!(failure.error, BridgeError::TransportConnectFailed { .. }));
    assert_eq!(failure.state, SessionState::TransportConnecting);
    assert_eq!(world.network.connect_attempts(), 2);
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn integration_handshake_timeout() {
    let mut config = BridgeConfig::default();
    config.session.handshake_timeout_ms = 500;
    let world = TestWorld::with_config(config);
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    // listening, but nobody answers
    let _listener = world.network.listen(SOCKET_ADDR).unwrap();

    let (client, _) = client(&world).await;
    let failure = client
        .manager
        .connect("demo-client", &server_id.did, b"init")
        .await
        .unwrap_err();
    assert!(matches!(failure.error, BridgeError::SessionTimeout(_)));
    assert_eq!(failure.state, SessionState::Handshaking);
    assert_eq!(failure.category(), ErrorCategory::Timeout);
}

#[tokio::test(start_paused = true)]
async fn integration_shutdown_cancels_resolution() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let (client, _) = client(&world).await;
    world.registry.set_resolve_delay(Duration::from_secs(3600));

    let manager = client.manager.clone();
    let did = server_id.did.clone();
    let pending = tokio::spawn(async move { manager.connect("demo-client", &did, b"init").await });

    tokio::time::sleep(Duration::from_millis(10)).await;
    client.manager.shutdown().await;

    let failure = pending.await.unwrap().unwrap_err();
    assert!(matches!(failure.error, BridgeError::Cancelled));
    assert_eq!(failure.state, SessionState::Resolving);
}

// ============================================================================
// Security
// ============================================================================

/// A node speaking to the server through a raw handle, so tests can send
/// arbitrary envelopes.
struct RawPeer {
    codec: EnvelopeCodec,
    handle: Arc<dyn TransportHandle>,
}

async fn raw_peer(world: &TestWorld, server_did: &str, claimed_did: Option<&str>) -> (RawPeer, Identity) {
    let node = world.node();
    let id = identity(&node, "raw", TransportKind::PushStream, "tmcpclient://").await;
    let server_doc = node.resolver.resolve(server_did).await.unwrap();
    use tmcp_core::engine::SealingEngine;
    node.engine.trust_peer(&server_doc.document).unwrap();

    let address = with_caller_did(&server_doc.endpoint_address, claimed_did.unwrap_or(&id.did)).unwrap();
    let handle = world
        .network
        .adapter(server_doc.transport_kind)
        .connect(&address)
        .await
        .unwrap();
    let codec = EnvelopeCodec::new(node.engine.clone(), id.clone(), server_did, 64, 1 << 20);
    (RawPeer { codec, handle }, id)
}

impl RawPeer {
    async fn seal(&self, message: &[u8]) -> bytes::Bytes {
        self.codec.seal(message).await.unwrap().bytes
    }
}

#[tokio::test]
async fn integration_impostor_rejected() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let listener = world.network.listen(SOCKET_ADDR).unwrap();
    let (_, victim) = client(&world).await;

    // claims to be the victim but seals with its own keys
    let (impostor, _) = raw_peer(&world, &server_id.did, Some(&victim.did)).await;
    impostor.handle.send(impostor.seal(b"init").await).await.unwrap();

    let incoming = listener.accept().await.unwrap();
    let failure = server.manager.accept("demo-server", incoming).await.unwrap_err();
    match &failure.error {
        BridgeError::SenderMismatch { expected, actual } => {
            assert_eq!(expected, &victim.did);
            assert_ne!(actual, &victim.did);
        }
        other => panic!("expected SenderMismatch, got {other:?}"),
    }
    assert_eq!(failure.state, SessionState::Handshaking);
    assert_eq!(failure.category(), ErrorCategory::SecurityViolation);
}

#[tokio::test]
async fn integration_published_but_unresolved_sender_is_mismatch() {
    let world = TestWorld::new();
    let (a, a_id) = client(&world).await;
    let (b, b_id) = client(&world).await;
    let (c, c_id) = client(&world).await;

    trust(&b, &a_id.did).await;
    trust(&c, &b_id.did).await;
    trust(&a, &b_id.did).await;

    let from_c = EnvelopeCodec::new(c.engine.clone(), c_id.clone(), b_id.did.clone(), 64, 1 << 20);
    let expecting_a = EnvelopeCodec::new(b.engine.clone(), b_id.clone(), a_id.did.clone(), 64, 1 << 20);

    let sealed = from_c.seal(b"hello").await.unwrap();
    match expecting_a.open(&sealed.bytes).await {
        Err(BridgeError::SenderMismatch { expected, actual }) => {
            assert_eq!(expected, a_id.did);
            assert_eq!(actual, c_id.did);
        }
        other => panic!("expected SenderMismatch, got {other:?}"),
    }
    assert!(!b.engine.trusts(&c_id.did));

    // the expected peer still gets through
    let from_a = EnvelopeCodec::new(a.engine.clone(), a_id.clone(), b_id.did.clone(), 64, 1 << 20);
    let sealed = from_a.seal(b"hello").await.unwrap();
    assert_eq!(expecting_a.open(&sealed.bytes).await.unwrap().len(), 1);
}

#[tokio::test]
async fn integration_replay_dropped_and_reorder_released() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let listener = world.network.listen(SOCKET_ADDR).unwrap();

    let (peer, peer_id) = raw_peer(&world, &server_id.did, None).await;
    let first = peer.seal(b"init").await;
    peer.handle.send(first.clone()).await.unwrap();

    let incoming = listener.accept().await.unwrap();
    let (session, init) = server.manager.accept("demo-server", incoming).await.unwrap();
    assert_eq!(&init[..], b"init");
    assert_eq!(session.peer_did(), peer_id.did);

    let two = peer.seal(b"two").await;
    let three = peer.seal(b"three").await;
    peer.handle.send(first).await.unwrap(); // replay
    peer.handle.send(three).await.unwrap(); // early
    peer.handle.send(two).await.unwrap();

    assert_eq!(&session.recv().await.unwrap()[..], b"two");
    assert_eq!(&session.recv().await.unwrap()[..], b"three");
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.stats().replayed, 1);
}

#[tokio::test]
async fn integration_handshake_counts_buffered_and_replayed() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let listener = world.network.listen(SOCKET_ADDR).unwrap();

    let (peer, _) = raw_peer(&world, &server_id.did, None).await;
    let one = peer.seal(b"one").await;
    let two = peer.seal(b"two").await;
    peer.handle.send(two.clone()).await.unwrap(); // early
    peer.handle.send(two).await.unwrap(); // replay of a buffered envelope
    peer.handle.send(one).await.unwrap();

    let incoming = listener.accept().await.unwrap();
    let (session, first) = server.manager.accept("demo-server", incoming).await.unwrap();
    assert_eq!(&first[..], b"one");
    assert_eq!(&session.recv().await.unwrap()[..], b"two");

    let stats = session.stats();
    assert_eq!(stats.opened, 2);
    assert_eq!(stats.replayed, 1);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn integration_tampered_envelope_fails_session() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = identity(&server, "demo-server", TransportKind::BidirectionalSocket, SOCKET_ADDR).await;
    let listener = world.network.listen(SOCKET_ADDR).unwrap();

    let (peer, _) = raw_peer(&world, &server_id.did, None).await;
    peer.handle.send(peer.seal(b"init").await).await.unwrap();
    let incoming = listener.accept().await.unwrap();
    let (session, _) = server.manager.accept("demo-server", incoming).await.unwrap();

    let mut tampered = peer.seal(b"payload").await.to_vec();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x80;
    peer.handle.send(tampered.into()).await.unwrap();

    assert_eq!(session.closed().await, SessionState::Failed);
    let failure = session.failure().unwrap();
    assert!(matches!(failure.error, BridgeError::AuthenticationFailed(_)));
    assert_eq!(failure.state, SessionState::Active);
    assert!(matches!(session.recv().await, Err(BridgeError::AuthenticationFailed(_))));
    assert!(matches!(session.send(b"after").await, Err(BridgeError::AuthenticationFailed(_))));
    assert_eq!(session.stats().sealed, 0);
}
