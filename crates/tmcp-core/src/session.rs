//! Session management.
//!
//! A [`Session`] is one secured relationship with one peer DID over one
//! transport connection. The [`SessionManager`] drives setup:
//!
//! ```text
//! INIT -> RESOLVING -> TRANSPORT_CONNECTING -> HANDSHAKING -> ACTIVE -> CLOSING -> CLOSED
//!                 ^             |
//!                 +-- once -----+   (connect failed: invalidate and re-resolve)
//! ```
//!
//! with `FAILED` reachable from every non-terminal state. Accepted sessions
//! skip `TRANSPORT_CONNECTING` since the connection already exists.
//!
//! Once active, a writer task sends sealed envelopes in submission order and
//! a reader task opens inbound envelopes and releases them in sequence order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tmcp_transport::{with_caller_did, Incoming, TransportAdapter, TransportError, TransportHandle, TransportKind};

use crate::codec::EnvelopeCodec;
use crate::config::SessionConfig;
use crate::engine::SealingEngine;
use crate::errors::{BridgeError, SessionFailure};
use crate::identity::IdentityStore;
use crate::resolver::DidResolver;
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::transport::TransportRegistry;
use crate::types::{Identity, SessionState};

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct SessionStats {
    /// Envelopes sealed for sending
    pub sealed: AtomicU64,
    /// Envelopes opened and accepted
    pub opened: AtomicU64,
    /// Messages handed to the protocol layer
    pub delivered: AtomicU64,
    /// Envelopes dropped as replays
    pub replayed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionStatsSnapshot {
    pub sealed: u64,
    pub opened: u64,
    pub delivered: u64,
    pub replayed: u64,
    /// Envelopes currently waiting for a sequence gap to fill
    pub buffered: usize,
}

impl SessionStats {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Session
// ============================================================================

enum Outbound {
    Envelope(Bytes),
    Close(oneshot::Sender<()>),
}

struct SessionCore {
    id: Uuid,
    local: Identity,
    peer_did: String,
    kind: TransportKind,
    handle: Arc<dyn TransportHandle>,
    codec: EnvelopeCodec,
    state: watch::Sender<SessionState>,
    failure: Mutex<Option<SessionFailure>>,
    stats: SessionStats,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCore {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn transition(&self, to: SessionState) -> bool {
        let mut from = None;
        self.state.send_if_modified(|current| {
            let allowed = match (*current, to) {
                (SessionState::Active, SessionState::Closing) => true,
                (SessionState::Active | SessionState::Closing, SessionState::Closed) => true,
                (state, SessionState::Failed) => !state.is_terminal(),
                _ => false,
            };
            if allowed {
                from = Some(*current);
                *current = to;
            }
            allowed
        });
        match from {
            Some(from) => {
                debug!(session = %self.id, peer = %self.peer_did, %from, %to, "session state changed");
                true
            }
            None => false,
        }
    }

    /// Record `error` as the terminal failure unless the session already ended.
    fn fail(&self, error: BridgeError) -> SessionFailure {
        let mut failure = self.failure.lock();
        let state = self.state();
        if state.is_terminal() {
            return failure
                .clone()
                .unwrap_or_else(|| SessionFailure::new(state, error));
        }
        let recorded = SessionFailure::new(state, error);
        *failure = Some(recorded.clone());
        self.transition(SessionState::Failed);
        error!(
            session = %self.id,
            peer = %self.peer_did,
            state = %recorded.state,
            kind = ?recorded.kind(),
            error = %recorded.error,
            "session failed"
        );
        recorded
    }

    fn terminal_error(&self) -> BridgeError {
        match self.failure.lock().as_ref() {
            Some(failure) => failure.error.clone(),
            None => BridgeError::Closed,
        }
    }

    async fn terminated(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_terminal()).await;
    }

    async fn finish_close(&self) {
        self.transition(SessionState::Closing);
        if let Err(e) = self.handle.close().await {
            debug!(session = %self.id, error = %e, "transport close failed");
        }
        if self.transition(SessionState::Closed) {
            info!(session = %self.id, peer = %self.peer_did, "session closed");
        }
    }

    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn stats(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            sealed: self.stats.sealed.load(Ordering::Relaxed),
            opened: self.stats.opened.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            replayed: self.stats.replayed.load(Ordering::Relaxed),
            buffered: self.codec.buffered(),
        }
    }
}

fn transport_failure(address: &str, e: TransportError) -> BridgeError {
    BridgeError::TransportConnectFailed {
        address: address.to_string(),
        reason: e.to_string(),
    }
}

/// An active session with one peer.
pub struct Session {
    core: Arc<SessionCore>,
    outbound: mpsc::Sender<Outbound>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    send_lock: tokio::sync::Mutex<()>,
    close_grace: Duration,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn local(&self) -> &Identity {
        &self.core.local
    }

    pub fn peer_did(&self) -> &str {
        &self.core.peer_did
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.core.kind
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// The terminal error, once the session has failed.
    pub fn failure(&self) -> Option<SessionFailure> {
        self.core.failure.lock().clone()
    }

    pub fn stats(&self) -> SessionStatsSnapshot {
        self.core.stats()
    }

    /// Seal `message` and queue it for sending. Messages go out in the order
    /// `send` is called.
    pub async fn send(&self, message: &[u8]) -> Result<(), BridgeError> {
        let _order = self.send_lock.lock().await;
        let state = self.state();
        if state != SessionState::Active {
            return Err(match state {
                SessionState::Closed | SessionState::Failed => self.core.terminal_error(),
                other => BridgeError::InvalidState(format!("cannot send while {other}")),
            });
        }

        let envelope = match self.core.codec.seal(message).await {
            Ok(envelope) => envelope,
            Err(e) => {
                self.core.fail(e.clone());
                let _ = self.core.handle.close().await;
                return Err(e);
            }
        };
        SessionStats::inc(&self.core.stats.sealed);
        debug!(
            session = %self.core.id,
            sequence = envelope.sequence,
            len = message.len(),
            "message sealed"
        );

        self.outbound
            .send(Outbound::Envelope(envelope.bytes))
            .await
            .map_err(|_| self.core.terminal_error())
    }

    /// Wait for the next inbound message.
    ///
    /// Returns the session's terminal error once it has ended and every
    /// already-opened message has been taken.
    pub async fn recv(&self) -> Result<Bytes, BridgeError> {
        match self.inbound.lock().await.recv().await {
            Some(message) => Ok(message),
            None => Err(self.core.terminal_error()),
        }
    }

    /// Flush queued messages, close the transport and end the session.
    /// Closing an ended session does nothing.
    pub async fn close(&self) -> Result<(), BridgeError> {
        if !self.core.transition(SessionState::Closing) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Close(ack_tx)).await.is_err() {
            self.core.finish_close().await;
            return Ok(());
        }
        if tokio::time::timeout(self.close_grace, ack_rx).await.is_err() {
            warn!(session = %self.core.id, "flush did not finish in time, closing anyway");
            self.core.abort_tasks();
            self.core.finish_close().await;
        }
        Ok(())
    }

    /// Wait until the session is closed or failed.
    pub async fn closed(&self) -> SessionState {
        self.core.terminated().await;
        self.state()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("local", &self.core.local.did)
            .field("peer", &self.core.peer_did)
            .field("kind", &self.core.kind)
            .field("state", &self.state())
            .finish()
    }
}

async fn run_writer(
    core: Arc<SessionCore>,
    mut rx: mpsc::Receiver<Outbound>,
    mut shutdown: ShutdownSignal,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = rx.recv() => next,
            _ = core.terminated() => return,
            _ = shutdown.cancelled() => {
                debug!(session = %core.id, "shutdown: flushing outbound queue");
                while let Ok(item) = rx.try_recv() {
                    if let Outbound::Envelope(bytes) = item {
                        if core.handle.send(bytes).await.is_err() {
                            break;
                        }
                    }
                }
                core.finish_close().await;
                return;
            }
        };

        match next {
            Some(Outbound::Envelope(bytes)) => {
                if let Err(e) = core.handle.send(bytes).await {
                    match e {
                        TransportError::Closed => {
                            debug!(session = %core.id, "transport closed under writer");
                            core.finish_close().await;
                        }
                        other => {
                            core.fail(transport_failure(core.handle.peer_address(), other));
                            let _ = core.handle.close().await;
                        }
                    }
                    return;
                }
            }
            Some(Outbound::Close(ack)) => {
                core.finish_close().await;
                let _ = ack.send(());
                return;
            }
            None => {
                // the Session was dropped without closing
                core.finish_close().await;
                return;
            }
        }
    }
}

async fn run_reader(core: Arc<SessionCore>, tx: mpsc::Sender<Bytes>, mut shutdown: ShutdownSignal) {
    loop {
        let received = tokio::select! {
            received = core.handle.receive() => received,
            _ = shutdown.cancelled() => return,
        };

        match received {
            Ok(bytes) => match core.codec.open(&bytes).await {
                Ok(messages) => {
                    SessionStats::inc(&core.stats.opened);
                    for message in messages {
                        SessionStats::inc(&core.stats.delivered);
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) if !e.is_session_fatal() => {
                    SessionStats::inc(&core.stats.replayed);
                    error!(session = %core.id, peer = %core.peer_did, error = %e, "dropping replayed envelope");
                }
                Err(e) => {
                    core.fail(e);
                    let _ = core.handle.close().await;
                    return;
                }
            },
            Err(TransportError::Closed) => {
                if core.state() == SessionState::Active {
                    info!(session = %core.id, peer = %core.peer_did, "peer closed the session");
                    core.finish_close().await;
                }
                return;
            }
            Err(e) => {
                core.fail(transport_failure(core.handle.peer_address(), e));
                let _ = core.handle.close().await;
                return;
            }
        }
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Tracks the state of a session that is still being set up.
struct Setup<'a> {
    peer_did: &'a str,
    state: SessionState,
}

impl<'a> Setup<'a> {
    fn new(peer_did: &'a str) -> Self {
        Self {
            peer_did,
            state: SessionState::Init,
        }
    }

    fn enter(&mut self, to: SessionState) {
        debug!(peer = %self.peer_did, from = %self.state, %to, "session state changed");
        self.state = to;
    }

    fn fail(&self, error: BridgeError) -> SessionFailure {
        error!(
            peer = %self.peer_did,
            state = %self.state,
            kind = ?error.kind(),
            error = %error,
            "session setup failed"
        );
        SessionFailure::new(self.state, error)
    }
}

/// What the handshake read up to the first deliverable message.
struct Opening {
    messages: Vec<Bytes>,
    opened: u64,
    replayed: u64,
}

async fn cancellable<T>(
    signal: &mut ShutdownSignal,
    work: impl Future<Output = Result<T, BridgeError>>,
) -> Result<T, BridgeError> {
    tokio::select! {
        biased;
        _ = signal.cancelled() => Err(BridgeError::Cancelled),
        result = work => result,
    }
}

pub struct SessionManager {
    identities: Arc<IdentityStore>,
    resolver: Arc<DidResolver>,
    transports: TransportRegistry,
    engine: Arc<dyn SealingEngine>,
    config: SessionConfig,
    shutdown: Shutdown,
    sessions: DashMap<Uuid, Weak<SessionCore>>,
}

impl SessionManager {
    pub fn new(
        identities: Arc<IdentityStore>,
        resolver: Arc<DidResolver>,
        transports: TransportRegistry,
        engine: Arc<dyn SealingEngine>,
        config: SessionConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            identities,
            resolver,
            transports,
            engine,
            config,
            shutdown,
            sessions: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &Arc<DidResolver> {
        &self.resolver
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Sessions that have not yet ended.
    pub fn active_sessions(&self) -> usize {
        self.prune();
        self.sessions.len()
    }

    fn prune(&self) {
        self.sessions.retain(|_, core| {
            core.upgrade()
                .map(|c| !c.state().is_terminal())
                .unwrap_or(false)
        });
    }

    /// Open a session to `peer_did` as the local identity `alias`.
    ///
    /// `handshake` is the protocol's opening message. The session becomes
    /// active once the peer's first reply has been opened; that reply is
    /// returned alongside the session.
    pub async fn connect(
        &self,
        alias: &str,
        peer_did: &str,
        handshake: &[u8],
    ) -> Result<(Session, Bytes), SessionFailure> {
        let mut signal = self.shutdown.signal();
        let mut setup = Setup::new(peer_did);
        let local = self.local_identity(alias).await.map_err(|e| setup.fail(e))?;

        let mut retried = false;
        let (handle, kind) = loop {
            setup.enter(SessionState::Resolving);
            let peer = cancellable(&mut signal, self.resolver.resolve(peer_did))
                .await
                .map_err(|e| setup.fail(e))?;
            self.engine.trust_peer(&peer.document).map_err(|e| {
                setup.fail(BridgeError::UnresolvableDid {
                    did: peer_did.to_string(),
                    reason: e.to_string(),
                })
            })?;

            setup.enter(SessionState::TransportConnecting);
            let adapter = self
                .transports
                .adapter_for(peer.transport_kind)
                .map_err(|e| setup.fail(e))?;
            let address = with_caller_did(&peer.endpoint_address, &local.did).map_err(|e| {
                setup.fail(BridgeError::UnresolvableDid {
                    did: peer_did.to_string(),
                    reason: e.to_string(),
                })
            })?;

            match cancellable(&mut signal, self.connect_once(adapter.as_ref(), &address)).await {
                Ok(handle) => break (handle, peer.transport_kind),
                Err(BridgeError::Cancelled) => return Err(setup.fail(BridgeError::Cancelled)),
                Err(e) if !retried => {
                    warn!(
                        peer = %peer_did,
                        address = %peer.endpoint_address,
                        error = %e,
                        "connect failed, re-resolving peer"
                    );
                    self.resolver.invalidate(peer_did);
                    retried = true;
                }
                Err(e) => return Err(setup.fail(e)),
            }
        };

        setup.enter(SessionState::Handshaking);
        let codec = self.codec(&local, peer_did);
        let opened = cancellable(&mut signal, async {
            let envelope = codec.seal(handshake).await?;
            handle
                .send(envelope.bytes)
                .await
                .map_err(|e| transport_failure(handle.peer_address(), e))?;
            self.await_first(&codec, handle.as_ref()).await
        })
        .await;

        match opened {
            Ok(mut opening) => {
                let first = opening.messages.remove(0);
                let session = self.activate(local, peer_did, kind, handle, codec, opening, 1);
                Ok((session, first))
            }
            Err(e) => {
                let _ = handle.close().await;
                Err(setup.fail(e))
            }
        }
    }

    /// Take over an inbound connection as the local identity `alias`.
    ///
    /// The caller's DID comes from the connection; its document is resolved
    /// for keys. Returns the session and the caller's first message.
    pub async fn accept(&self, alias: &str, incoming: Incoming) -> Result<(Session, Bytes), SessionFailure> {
        let Incoming { peer_did, handle, .. } = incoming;
        let peer_label = peer_did.clone().unwrap_or_else(|| handle.peer_address().to_string());
        let mut setup = Setup::new(&peer_label);

        let result = self.accept_inner(alias, peer_did, &handle, &mut setup).await;
        match result {
            Ok((local, peer_did, codec, mut opening)) => {
                let first = opening.messages.remove(0);
                let session =
                    self.activate(local, &peer_did, handle.kind(), handle.clone(), codec, opening, 0);
                Ok((session, first))
            }
            Err(e) => {
                let _ = handle.close().await;
                Err(setup.fail(e))
            }
        }
    }

    async fn accept_inner(
        &self,
        alias: &str,
        peer_did: Option<String>,
        handle: &Arc<dyn TransportHandle>,
        setup: &mut Setup<'_>,
    ) -> Result<(Identity, String, EnvelopeCodec, Opening), BridgeError> {
        let mut signal = self.shutdown.signal();
        let local = self.local_identity(alias).await?;
        let peer_did = peer_did.ok_or_else(|| {
            BridgeError::AuthenticationFailed("caller did not present a DID".into())
        })?;

        setup.enter(SessionState::Resolving);
        let peer = cancellable(&mut signal, self.resolver.resolve(&peer_did)).await?;
        self.engine
            .trust_peer(&peer.document)
            .map_err(|e| BridgeError::UnresolvableDid {
                did: peer_did.clone(),
                reason: e.to_string(),
            })?;

        setup.enter(SessionState::Handshaking);
        let codec = self.codec(&local, &peer_did);
        let opening = cancellable(&mut signal, self.await_first(&codec, handle.as_ref())).await?;
        Ok((local, peer_did, codec, opening))
    }

    /// Trigger shutdown and wait, at most the configured grace period, for
    /// every session to end. Sessions still running after that are cut off.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let cores: Vec<Arc<SessionCore>> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        info!(sessions = cores.len(), "shutting down sessions");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        for core in cores {
            if tokio::time::timeout_at(deadline, core.terminated()).await.is_err() {
                warn!(session = %core.id, "session did not close within grace period");
                core.abort_tasks();
                let _ = core.handle.close().await;
                core.fail(BridgeError::Cancelled);
            }
        }
        self.sessions.clear();
    }

    async fn local_identity(&self, alias: &str) -> Result<Identity, BridgeError> {
        self.identities
            .get(alias)
            .await?
            .ok_or_else(|| BridgeError::InvalidState(format!("no published identity for alias {alias}")))
    }

    async fn connect_once(
        &self,
        adapter: &dyn TransportAdapter,
        address: &str,
    ) -> Result<Arc<dyn TransportHandle>, BridgeError> {
        debug!(%address, kind = %adapter.kind(), "connecting");
        match tokio::time::timeout(self.config.connect_timeout(), adapter.connect(address)).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => Err(transport_failure(address, e)),
            Err(_) => Err(BridgeError::TransportConnectFailed {
                address: address.to_string(),
                reason: "connect timed out".into(),
            }),
        }
    }

    /// Wait for the first deliverable inbound message(s), counting the
    /// envelopes opened and the replays dropped on the way.
    async fn await_first(
        &self,
        codec: &EnvelopeCodec,
        handle: &dyn TransportHandle,
    ) -> Result<Opening, BridgeError> {
        let first = async {
            let mut opened = 0;
            let mut replayed = 0;
            loop {
                let bytes = handle.receive().await.map_err(|e| match e {
                    TransportError::Closed => BridgeError::TransportConnectFailed {
                        address: handle.peer_address().to_string(),
                        reason: "closed during handshake".into(),
                    },
                    other => transport_failure(handle.peer_address(), other),
                })?;
                match codec.open(&bytes).await {
                    Ok(messages) => {
                        opened += 1;
                        if !messages.is_empty() {
                            return Ok(Opening {
                                messages,
                                opened,
                                replayed,
                            });
                        }
                    }
                    Err(e) if !e.is_session_fatal() => {
                        replayed += 1;
                        error!(peer = %codec.peer_did(), error = %e, "dropping replayed envelope");
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        tokio::time::timeout(self.config.handshake_timeout(), first)
            .await
            .map_err(|_| BridgeError::SessionTimeout("handshake".into()))?
    }

    fn codec(&self, local: &Identity, peer_did: &str) -> EnvelopeCodec {
        EnvelopeCodec::new(
            self.engine.clone(),
            local.clone(),
            peer_did,
            self.config.reorder_window,
            self.config.max_payload_bytes,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn activate(
        &self,
        local: Identity,
        peer_did: &str,
        kind: TransportKind,
        handle: Arc<dyn TransportHandle>,
        codec: EnvelopeCodec,
        opening: Opening,
        sealed: u64,
    ) -> Session {
        let Opening {
            messages: pending,
            opened,
            replayed,
        } = opening;
        let (state, _) = watch::channel(SessionState::Active);
        let core = Arc::new(SessionCore {
            id: Uuid::new_v4(),
            local,
            peer_did: peer_did.to_string(),
            kind,
            handle,
            codec,
            state,
            failure: Mutex::new(None),
            stats: SessionStats::default(),
            tasks: Mutex::new(Vec::new()),
        });
        core.stats.sealed.store(sealed, Ordering::Relaxed);
        core.stats.opened.store(opened, Ordering::Relaxed);
        core.stats.replayed.store(replayed, Ordering::Relaxed);
        core.stats
            .delivered
            .store(1 + pending.len() as u64, Ordering::Relaxed);

        let depth = self.config.outbound_queue_depth;
        let (out_tx, out_rx) = mpsc::channel(depth);
        let (in_tx, in_rx) = mpsc::channel(depth.max(self.config.reorder_window + 1));
        for message in pending {
            let _ = in_tx.try_send(message);
        }

        let writer = tokio::spawn(run_writer(core.clone(), out_rx, self.shutdown.signal()));
        let reader = tokio::spawn(run_reader(core.clone(), in_tx, self.shutdown.signal()));
        core.tasks.lock().extend([writer, reader]);
        self.prune();
        self.sessions.insert(core.id, Arc::downgrade(&core));

        info!(
            session = %core.id,
            local = %core.local.did,
            peer = %core.peer_did,
            %kind,
            "session active"
        );

        Session {
            core,
            outbound: out_tx,
            inbound: tokio::sync::Mutex::new(in_rx),
            send_lock: tokio::sync::Mutex::new(()),
            close_grace: self.config.shutdown_grace(),
        }
    }
}
