//! End-to-end session flows over the in-process network.

use std::sync::Arc;

use bytes::Bytes;
use tmcp_core::harness::{EchoHandler, Node, TestWorld};
use tmcp_core::types::{Advertisement, Identity, SessionState};
use tmcp_transport::TransportKind;

async fn start_server(world: &TestWorld, kind: TransportKind, address: &str) -> (Node, Identity) {
    let server = world.node();
    let identity = server
        .identities
        .load_or_create("demo-server", &Advertisement::new(kind, address))
        .await
        .expect("server identity");
    let listener = world.network.listen(address).expect("listen");
    server.serve("demo-server", listener, Arc::new(EchoHandler));
    (server, identity)
}

async fn client(world: &TestWorld) -> Node {
    let node = world.node();
    let placeholder = world.config.registry.client_placeholder_address.clone();
    node.identities
        .load_or_create(
            "demo-client",
            &Advertisement::new(TransportKind::PushStream, placeholder),
        )
        .await
        .expect("client identity");
    node
}

async fn echo_exchange(kind: TransportKind, address: &str) {
    let world = TestWorld::new();
    let (_server, server_id) = start_server(&world, kind, address).await;
    let client = client(&world).await;

    let (session, reply) = client
        .manager
        .connect("demo-client", &server_id.did, br#"{"jsonrpc":"2.0","id":0,"method":"initialize"}"#)
        .await
        .expect("session");
    assert_eq!(&reply[..], br#"{"jsonrpc":"2.0","id":0,"method":"initialize"}"#);
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.transport_kind(), kind);
    assert_eq!(session.peer_did(), server_id.did);

    for i in 1..=20u32 {
        let msg = format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/list"}}"#);
        session.send(msg.as_bytes()).await.unwrap();
    }
    for i in 1..=20u32 {
        let msg = format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"tools/list"}}"#);
        assert_eq!(session.recv().await.unwrap(), Bytes::from(msg));
    }

    let stats = session.stats();
    assert_eq!(stats.sealed, 21);
    assert_eq!(stats.delivered, 21);
    assert_eq!(stats.replayed, 0);

    session.close().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.failure().is_none());
    assert!(session.send(b"late").await.is_err());
}

#[tokio::test]
async fn test_echo_over_push_stream() {
    echo_exchange(TransportKind::PushStream, "mem+push://demo-server/sse").await;
}

#[tokio::test]
async fn test_echo_over_socket() {
    echo_exchange(TransportKind::BidirectionalSocket, "mem+socket://demo-server/ws").await;
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let world = TestWorld::new();
    let (_server, server_id) =
        start_server(&world, TransportKind::BidirectionalSocket, "mem+socket://demo-server/ws").await;
    let client = client(&world).await;

    let (one, _) = client.manager.connect("demo-client", &server_id.did, b"one").await.unwrap();
    let (two, _) = client.manager.connect("demo-client", &server_id.did, b"two").await.unwrap();
    assert_ne!(one.id(), two.id());
    assert_eq!(client.manager.active_sessions(), 2);

    one.close().await.unwrap();
    two.send(b"still here").await.unwrap();
    assert_eq!(&two.recv().await.unwrap()[..], b"still here");
    assert_eq!(client.manager.active_sessions(), 1);

    // the second connect reused the cached document
    assert_eq!(client.resolver.fetch_count(), 1);
}

#[tokio::test]
async fn test_peer_close_ends_session() {
    let world = TestWorld::new();
    let server = world.node();
    let server_id = server
        .identities
        .load_or_create(
            "demo-server",
            &Advertisement::new(TransportKind::BidirectionalSocket, "mem+socket://demo-server/ws"),
        )
        .await
        .unwrap();
    let listener = world.network.listen("mem+socket://demo-server/ws").unwrap();
    let client = client(&world).await;

    let server_side = {
        let manager = server.manager.clone();
        tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            let (session, first) = manager.accept("demo-server", incoming).await.unwrap();
            session.send(&first).await.unwrap();
            session
        })
    };

    let (session, reply) = client.manager.connect("demo-client", &server_id.did, b"hello").await.unwrap();
    assert_eq!(&reply[..], b"hello");

    let server_session = server_side.await.unwrap();
    assert_eq!(server_session.peer_did(), client.identities.get("demo-client").await.unwrap().unwrap().did);
    server_session.send(b"bye").await.unwrap();
    server_session.close().await.unwrap();

    // queued message still arrives, then the close
    assert_eq!(&session.recv().await.unwrap()[..], b"bye");
    assert_eq!(session.closed().await, SessionState::Closed);
    assert!(matches!(
        session.recv().await,
        Err(tmcp_core::BridgeError::Closed)
    ));
}

#[tokio::test]
async fn test_shutdown_closes_active_sessions() {
    let world = TestWorld::new();
    let (_server, server_id) =
        start_server(&world, TransportKind::PushStream, "mem+push://demo-server/sse").await;
    let client = client(&world).await;

    let (session, _) = client.manager.connect("demo-client", &server_id.did, b"hi").await.unwrap();
    client.manager.shutdown().await;

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(client.manager.active_sessions(), 0);
    assert!(session.recv().await.is_err());
}

#[tokio::test]
async fn test_close_unblocks_pending_recv() {
    let world = TestWorld::new();
    let (_server, server_id) =
        start_server(&world, TransportKind::BidirectionalSocket, "mem+socket://demo-server/ws").await;
    let client = client(&world).await;

    let (session, _) = client.manager.connect("demo-client", &server_id.did, b"hi").await.unwrap();
    let session = Arc::new(session);
    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.recv().await })
    };
    tokio::task::yield_now().await;

    session.close().await.unwrap();
    let received = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
        .await
        .expect("recv still blocked after close")
        .unwrap();
    assert!(matches!(received, Err(tmcp_core::BridgeError::Closed)));
    assert!(matches!(
        session.send(b"late").await,
        Err(tmcp_core::BridgeError::Closed)
    ));
}
