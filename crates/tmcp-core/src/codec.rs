//! Per-session envelope codec.
//!
//! Outbound plaintext is wrapped with the next sequence number and sealed to
//! the peer. Inbound envelopes are checked against the expected peer, opened
//! and passed through a reorder window so the protocol layer sees them in
//! strictly increasing sequence order.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use tracing::warn;

use tmcp_crypto::envelope::{decode_envelope, peek_routing};
use tmcp_crypto::replay::{MonotonicCounter, ReorderError, ReorderWindow};
use tmcp_proto::v1::SequencedPayloadV1;

use crate::engine::{SealError, SealingEngine};
use crate::errors::BridgeError;
use crate::types::Identity;

/// A sealed outbound message, ready for a transport.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sender_did: String,
    pub recipient_did: String,
    pub sequence: u64,
    pub bytes: Bytes,
}

pub struct EnvelopeCodec {
    engine: Arc<dyn SealingEngine>,
    local: Identity,
    peer_did: String,
    max_payload_bytes: usize,
    outbound: MonotonicCounter,
    inbound: Mutex<ReorderWindow<Bytes>>,
}

impl EnvelopeCodec {
    pub fn new(
        engine: Arc<dyn SealingEngine>,
        local: Identity,
        peer_did: impl Into<String>,
        reorder_window: usize,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            engine,
            local,
            peer_did: peer_did.into(),
            max_payload_bytes,
            outbound: MonotonicCounter::default(),
            inbound: Mutex::new(ReorderWindow::new(reorder_window)),
        }
    }

    pub fn peer_did(&self) -> &str {
        &self.peer_did
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Seal `plaintext` to the peer under the next outbound sequence number.
    pub async fn seal(&self, plaintext: &[u8]) -> Result<Envelope, BridgeError> {
        if plaintext.len() > self.max_payload_bytes {
            return Err(BridgeError::SealingFailed(format!(
                "payload of {} bytes exceeds limit of {}",
                plaintext.len(),
                self.max_payload_bytes
            )));
        }

        let sequence = self.outbound.increment();
        let wrapped = SequencedPayloadV1 {
            sequence,
            body: plaintext.to_vec(),
        }
        .encode_to_vec();

        let bytes = self
            .engine
            .seal(&self.local.key, &self.peer_did, &wrapped)
            .await
            .map_err(|e| BridgeError::SealingFailed(e.to_string()))?;

        Ok(Envelope {
            sender_did: self.local.did.clone(),
            recipient_did: self.peer_did.clone(),
            sequence,
            bytes,
        })
    }

    /// Open an inbound envelope.
    ///
    /// Returns the messages now deliverable, in order. An empty vector means
    /// the envelope arrived early and is buffered.
    pub async fn open(&self, envelope: &[u8]) -> Result<Vec<Bytes>, BridgeError> {
        // A stranger is a mismatch whether or not this node trusts its keys.
        let routed_sender = decode_envelope(envelope)
            .ok()
            .and_then(|env| peek_routing(&env).map(|(sender, _)| sender.to_string()));
        if let Some(sender) = routed_sender {
            self.check_sender(sender)?;
        }

        let (sender, wrapped) = self
            .engine
            .open(&self.local.key, envelope)
            .await
            .map_err(|e| match e {
                SealError::UnknownKey(_) | SealError::Unbound(_) => {
                    BridgeError::InvalidState(e.to_string())
                }
                other => BridgeError::AuthenticationFailed(other.to_string()),
            })?;

        self.check_sender(sender)?;

        let payload = SequencedPayloadV1::decode(wrapped)
            .map_err(|e| BridgeError::AuthenticationFailed(format!("bad sequenced payload: {e}")))?;
        if payload.sequence == 0 {
            return Err(BridgeError::AuthenticationFailed("sequence 0 is never issued".into()));
        }

        let mut window = self.inbound.lock();
        window
            .admit(payload.sequence, Bytes::from(payload.body))
            .map_err(|e| match e {
                ReorderError::Replayed { sequence, next_expected } => BridgeError::ReplayedEnvelope {
                    sequence,
                    last_accepted: next_expected - 1,
                },
                ReorderError::Duplicate { sequence } => BridgeError::ReplayedEnvelope {
                    sequence,
                    last_accepted: window.last_accepted(),
                },
            })
    }

    fn check_sender(&self, sender: String) -> Result<(), BridgeError> {
        if sender == self.peer_did {
            return Ok(());
        }
        warn!(expected = %self.peer_did, actual = %sender, "envelope from unexpected sender");
        Err(BridgeError::SenderMismatch {
            expected: self.peer_did.clone(),
            actual: sender,
        })
    }

    /// Inbound envelopes buffered while waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.inbound.lock().buffered()
    }

    pub fn last_accepted(&self) -> u64 {
        self.inbound.lock().last_accepted()
    }

    pub fn last_sent(&self) -> u64 {
        self.outbound.current()
    }
}
