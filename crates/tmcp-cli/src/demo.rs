//! In-process demo session.
//!
//! Starts an echo server and a client on one memory network and DID
//! registry, opens a session between them over the chosen transport kind
//! and exchanges a series of JSON-RPC requests.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use tmcp_core::config::BridgeConfig;
use tmcp_core::harness::{EchoHandler, TestWorld};
use tmcp_core::types::{Advertisement, SessionState};
use tmcp_core::{BridgeError, SessionFailure};
use tmcp_transport::TransportKind;

pub const SERVER_ALIAS: &str = "demo-server";
pub const CLIENT_ALIAS: &str = "demo-client";

/// Outcome of a demo run.
#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub transport_kind: TransportKind,
    pub server_address: String,
    pub server_did: String,
    pub client_did: String,
    pub session_id: String,
    pub messages: u32,
    pub round_trips: u32,
    pub elapsed_ms: u64,
    pub sealed: u64,
    pub opened: u64,
    pub delivered: u64,
    pub replayed: u64,
    pub final_state: SessionState,
}

/// Endpoint address the demo server listens on.
pub fn server_address(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::PushStream => "mem+push://demo-server/sse",
        TransportKind::BidirectionalSocket => "mem+socket://demo-server/ws",
    }
}

fn request(id: u32, method: &str) -> String {
    format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"{method}"}}"#)
}

/// Run the demo. Triggering `interrupt` aborts it with
/// [`BridgeError::Cancelled`].
pub async fn run(
    config: BridgeConfig,
    kind: TransportKind,
    messages: u32,
    interrupt: impl std::future::Future<Output = ()>,
) -> Result<DemoReport, SessionFailure> {
    let world = TestWorld::with_config(config);
    let address = server_address(kind);

    let server = world.node();
    let client = world.node();

    let exchange = async {
        let server_identity = server
            .identities
            .load_or_create(SERVER_ALIAS, &Advertisement::new(kind, address))
            .await
            .map_err(|e| SessionFailure::new(SessionState::Init, e))?;
        let listener = world
            .network
            .listen(address)
            .map_err(|e| SessionFailure::new(SessionState::Init, BridgeError::InvalidState(e.to_string())))?;
        server.serve(SERVER_ALIAS, listener, Arc::new(EchoHandler));
        info!(did = %server_identity.did, %address, %kind, "demo server listening");

        let placeholder = world.config.registry.client_placeholder_address.clone();
        let client_identity = client
            .identities
            .load_or_create(CLIENT_ALIAS, &Advertisement::new(kind, placeholder))
            .await
            .map_err(|e| SessionFailure::new(SessionState::Init, e))?;

        let started = Instant::now();
        let (session, _reply) = client
            .manager
            .connect(CLIENT_ALIAS, &server_identity.did, request(0, "initialize").as_bytes())
            .await?;
        info!(session = %session.id(), peer = %session.peer_did(), "demo session active");

        let mut round_trips = 0;
        for id in 1..=messages {
            let message = request(id, "tools/list");
            let fail = |e| SessionFailure::new(SessionState::Active, e);
            session.send(message.as_bytes()).await.map_err(fail)?;
            let reply = session.recv().await.map_err(fail)?;
            if reply.as_ref() != message.as_bytes() {
                return Err(fail(BridgeError::InvalidState(format!(
                    "reply {id} does not match its request"
                ))));
            }
            debug!(id, "round trip complete");
            round_trips += 1;
        }

        let stats = session.stats();
        session
            .close()
            .await
            .map_err(|e| SessionFailure::new(SessionState::Closing, e))?;

        Ok::<_, SessionFailure>(DemoReport {
            transport_kind: kind,
            server_address: address.to_string(),
            server_did: server_identity.did,
            client_did: client_identity.did,
            session_id: session.id().to_string(),
            messages,
            round_trips,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            sealed: stats.sealed,
            opened: stats.opened,
            delivered: stats.delivered,
            replayed: stats.replayed,
            final_state: session.state(),
        })
    };

    let result = tokio::select! {
        biased;
        _ = interrupt => {
            info!("demo interrupted");
            Err(SessionFailure::new(SessionState::Active, BridgeError::Cancelled))
        }
        result = exchange => result,
    };

    client.manager.shutdown().await;
    server.manager.shutdown().await;
    result
}
