//! In-process transports.
//!
//! [`MemoryNetwork`] stands in for real push-stream and socket transports in
//! tests and in the demo: servers `listen` on an address, clients `connect`
//! through a [`MemoryAdapter`] of the matching kind, and each side gets a
//! [`TransportHandle`]. Frames are encoded exactly as the kind requires
//! (text events for push streams, length-prefixed binary for sockets), so
//! framing bugs surface here too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::address::{caller_did, scheme_kind, strip_query};
use crate::framing::{FramingError, LengthCodec, TextEventCodec, MAX_ENVELOPE_SIZE};
use crate::traits::{TransportAdapter, TransportError, TransportHandle, TransportKind};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// A connection arriving at a [`MemoryListener`].
pub struct Incoming {
    /// Caller DID taken from the `did` query parameter, if present.
    pub peer_did: Option<String>,
    /// The full address the caller dialled.
    pub address: String,
    pub handle: Arc<dyn TransportHandle>,
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("peer_did", &self.peer_did)
            .field("address", &self.address)
            .field("kind", &self.handle.kind())
            .finish()
    }
}

struct ListenerEntry {
    id: u64,
    kind: TransportKind,
    tx: mpsc::UnboundedSender<Incoming>,
}

struct NetworkInner {
    listeners: DashMap<String, ListenerEntry>,
    next_listener_id: AtomicU64,
    connect_attempts: AtomicU64,
    max_frame_size: usize,
    channel_capacity: usize,
}

/// Shared in-process network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_limits(MAX_ENVELOPE_SIZE, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_limits(max_frame_size: usize, channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(1),
                connect_attempts: AtomicU64::new(0),
                max_frame_size,
                channel_capacity: channel_capacity.max(1),
            }),
        }
    }

    /// Start accepting connections on `address`. The transport kind is taken
    /// from the address scheme (`mem+push://` or `mem+socket://`). A second
    /// listener on the same address replaces the first.
    pub fn listen(&self, address: &str) -> Result<MemoryListener, TransportError> {
        let kind = scheme_kind(address)?
            .ok_or_else(|| TransportError::InvalidAddress(format!("{address}: unknown scheme")))?;
        let key = strip_query(address)?;
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .insert(key.clone(), ListenerEntry { id, kind, tx });
        tracing::debug!(address = %key, %kind, "memory listener bound");
        Ok(MemoryListener {
            id,
            address: key,
            kind,
            rx: tokio::sync::Mutex::new(rx),
            network: self.inner.clone(),
        })
    }

    /// Adapter that dials listeners of the given kind.
    pub fn adapter(&self, kind: TransportKind) -> MemoryAdapter {
        MemoryAdapter {
            kind,
            network: self.inner.clone(),
        }
    }

    /// Total connect attempts made through any adapter of this network.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn is_listening(&self, address: &str) -> bool {
        strip_query(address)
            .map(|key| self.inner.listeners.contains_key(&key))
            .unwrap_or(false)
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side of a memory endpoint. Dropping it unbinds the address.
pub struct MemoryListener {
    id: u64,
    address: String,
    kind: TransportKind,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    network: Arc<NetworkInner>,
}

impl MemoryListener {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Wait for the next connection. `None` once the listener is unbound.
    pub async fn accept(&self) -> Option<Incoming> {
        self.rx.lock().await.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        let id = self.id;
        self.network
            .listeners
            .remove_if(&self.address, |_, entry| entry.id == id);
    }
}

/// Dials [`MemoryListener`]s of one transport kind.
#[derive(Clone)]
pub struct MemoryAdapter {
    kind: TransportKind,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl TransportAdapter for MemoryAdapter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn TransportHandle>, TransportError> {
        self.network.connect_attempts.fetch_add(1, Ordering::Relaxed);

        if let Some(kind) = scheme_kind(address)? {
            if kind != self.kind {
                return Err(TransportError::InvalidAddress(format!(
                    "{address} is a {kind} endpoint, adapter speaks {}",
                    self.kind
                )));
            }
        }

        let key = strip_query(address)?;
        let connect_failed = |reason: &str| TransportError::ConnectFailed {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let (client, server) = handle_pair(
            self.kind,
            address,
            self.network.max_frame_size,
            self.network.channel_capacity,
        );
        let incoming = Incoming {
            peer_did: caller_did(address),
            address: address.to_string(),
            handle: Arc::new(server),
        };

        {
            let entry = self
                .network
                .listeners
                .get(&key)
                .ok_or_else(|| connect_failed("no listener at address"))?;
            if entry.kind != self.kind {
                return Err(connect_failed("listener speaks a different transport"));
            }
            entry
                .tx
                .send(incoming)
                .map_err(|_| connect_failed("listener gone"))?;
        }

        tracing::debug!(%address, kind = %self.kind, "memory connection established");
        Ok(Arc::new(client))
    }
}

#[derive(Debug)]
enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

enum FrameCodec {
    Text(TextEventCodec),
    Binary(LengthCodec),
}

impl FrameCodec {
    fn for_kind(kind: TransportKind, max_frame_size: usize) -> Self {
        match kind {
            TransportKind::PushStream => FrameCodec::Text(TextEventCodec::new(max_frame_size)),
            TransportKind::BidirectionalSocket => {
                FrameCodec::Binary(LengthCodec::new(max_frame_size))
            }
        }
    }

    fn encode(&self, data: &[u8]) -> Result<Frame, FramingError> {
        match self {
            FrameCodec::Text(c) => c.encode(data).map(Frame::Text),
            FrameCodec::Binary(c) => c.encode(data).map(Frame::Binary),
        }
    }

    fn decode(&self, frame: Frame) -> Result<Vec<u8>, FramingError> {
        match (self, frame) {
            (FrameCodec::Text(c), Frame::Text(event)) => c.decode(&event),
            (FrameCodec::Binary(c), Frame::Binary(raw)) => {
                let mut buf = BytesMut::from(&raw[..]);
                c.decode_stream(&mut buf)?.ok_or(FramingError::Incomplete(4))
            }
            _ => Err(FramingError::InvalidFormat),
        }
    }
}

/// One end of an in-process connection.
pub struct MemoryHandle {
    kind: TransportKind,
    peer_address: String,
    codec: FrameCodec,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    closed: Arc<watch::Sender<bool>>,
}

fn handle_pair(
    kind: TransportKind,
    address: &str,
    max_frame_size: usize,
    capacity: usize,
) -> (MemoryHandle, MemoryHandle) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let (closed, _) = watch::channel(false);
    let closed = Arc::new(closed);

    let client = MemoryHandle {
        kind,
        peer_address: address.to_string(),
        codec: FrameCodec::for_kind(kind, max_frame_size),
        tx: Mutex::new(Some(a_tx)),
        rx: tokio::sync::Mutex::new(b_rx),
        closed: closed.clone(),
    };
    let server = MemoryHandle {
        kind,
        peer_address: caller_did(address).unwrap_or_else(|| address.to_string()),
        codec: FrameCodec::for_kind(kind, max_frame_size),
        tx: Mutex::new(Some(b_tx)),
        rx: tokio::sync::Mutex::new(a_rx),
        closed,
    };
    (client, server)
}

impl MemoryHandle {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn peer_address(&self) -> &str {
        &self.peer_address
    }

    async fn send(&self, envelope: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = self.codec.encode(&envelope)?;
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        let mut closed = self.closed.subscribe();
        // a full channel must not outlive a close
        tokio::select! {
            sent = tx.send(frame) => sent.map_err(|_| TransportError::Closed),
            _ = closed.wait_for(|c| *c) => Err(TransportError::Closed),
        }
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;
        // queued frames are still delivered after the peer closes
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame.ok_or(TransportError::Closed)?,
            _ = closed.wait_for(|c| *c) => {
                match rx.try_recv() {
                    Ok(frame) => frame,
                    Err(_) => return Err(TransportError::Closed),
                }
            }
        };
        Ok(Bytes::from(self.codec.decode(frame)?))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.tx.lock().take();
        self.closed.send_replace(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SOCKET: &str = "mem+socket://server.test/ws";
    const PUSH: &str = "mem+push://server.test/sse";

    #[tokio::test]
    async fn test_socket_round_trip() {
        let net = MemoryNetwork::new();
        let listener = net.listen(SOCKET).unwrap();
        let adapter = net.adapter(TransportKind::BidirectionalSocket);

        let addr = format!("{SOCKET}?did=did:example:client");
        let client = adapter.connect(&addr).await.unwrap();
        let incoming = listener.accept().await.unwrap();
        assert_eq!(incoming.peer_did.as_deref(), Some("did:example:client"));

        client.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&incoming.handle.receive().await.unwrap()[..], b"ping");
        incoming.handle.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(&client.receive().await.unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn test_push_stream_round_trip() {
        let net = MemoryNetwork::new();
        let listener = net.listen(PUSH).unwrap();
        let client = net
            .adapter(TransportKind::PushStream)
            .connect(PUSH)
            .await
            .unwrap();
        let incoming = listener.accept().await.unwrap();
        assert!(incoming.peer_did.is_none());

        let payload = Bytes::from((0u8..=255).collect::<Vec<_>>());
        incoming.handle.send(payload.clone()).await.unwrap();
        assert_eq!(client.receive().await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let net = MemoryNetwork::new();
        let err = net
            .adapter(TransportKind::BidirectionalSocket)
            .connect(SOCKET)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
        assert_eq!(net.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_dropped_listener_unbinds() {
        let net = MemoryNetwork::new();
        let listener = net.listen(SOCKET).unwrap();
        assert!(net.is_listening(SOCKET));
        drop(listener);
        assert!(!net.is_listening(SOCKET));
    }

    #[tokio::test]
    async fn test_kind_mismatch_rejected() {
        let net = MemoryNetwork::new();
        let _listener = net.listen(SOCKET).unwrap();
        let err = net
            .adapter(TransportKind::PushStream)
            .connect(SOCKET)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let net = MemoryNetwork::new();
        let listener = net.listen(SOCKET).unwrap();
        let client = net
            .adapter(TransportKind::BidirectionalSocket)
            .connect(SOCKET)
            .await
            .unwrap();
        let server = listener.accept().await.unwrap().handle;

        let waiter = tokio::spawn(async move { server.receive().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            client.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_queued_frames_survive_close() {
        let net = MemoryNetwork::new();
        let listener = net.listen(SOCKET).unwrap();
        let client = net
            .adapter(TransportKind::BidirectionalSocket)
            .connect(SOCKET)
            .await
            .unwrap();
        let server = listener.accept().await.unwrap().handle;

        client.send(Bytes::from_static(b"last words")).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(&server.receive().await.unwrap()[..], b"last words");
        assert!(matches!(server.receive().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_oversize_frame_rejected() {
        let net = MemoryNetwork::with_limits(16, 8);
        let listener = net.listen(SOCKET).unwrap();
        let client = net
            .adapter(TransportKind::BidirectionalSocket)
            .connect(SOCKET)
            .await
            .unwrap();
        let _server = listener.accept().await.unwrap();
        assert!(matches!(
            client.send(Bytes::from(vec![0u8; 17])).await,
            Err(TransportError::Framing(FramingError::TooLarge(17, 16)))
        ));
    }
}
