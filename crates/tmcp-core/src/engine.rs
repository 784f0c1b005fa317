//! Sealing engine contract and the default local engine.
//!
//! An engine seals bytes from a local key to a recipient DID and opens
//! envelopes back into `(sender DID, bytes)`. It only opens envelopes from
//! senders whose verification keys it has been told to trust, which happens
//! when their DID document is resolved.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};

use tmcp_crypto::envelope::{decode_envelope, encode_envelope, open_envelope, peek_routing, seal_envelope};
use tmcp_crypto::keys::PublicKeys;

use crate::did::DidDocument;
use crate::keys::Keyring;
use crate::types::{unix_now, KeyHandle};

#[derive(Debug, Error, Clone)]
pub enum SealError {
    /// The key handle is not held by the engine's keyring.
    #[error("unknown key handle {0}")]
    UnknownKey(KeyHandle),

    /// The key exists but has no published DID yet.
    #[error("key {0} is not bound to a DID")]
    Unbound(KeyHandle),

    #[error("no trusted keys for {0}")]
    UnknownPeer(String),

    #[error("peer document unusable: {0}")]
    BadDocument(String),

    #[error("sealing rejected: {0}")]
    Rejected(String),

    /// The envelope failed structural, signature or decryption checks.
    #[error("envelope rejected: {0}")]
    Authentication(String),
}

#[async_trait]
pub trait SealingEngine: Send + Sync {
    /// Trust the verification keys published in `doc` for its DID.
    fn trust_peer(&self, doc: &DidDocument) -> Result<(), SealError>;

    async fn seal(&self, key: &KeyHandle, recipient_did: &str, payload: &[u8]) -> Result<Bytes, SealError>;

    /// Open an envelope addressed to the DID bound to `key`.
    async fn open(&self, key: &KeyHandle, envelope: &[u8]) -> Result<(String, Bytes), SealError>;
}

/// Engine backed by `tmcp-crypto` envelopes and a shared [`Keyring`].
pub struct LocalSealingEngine {
    keyring: Arc<Keyring>,
    peers: DashMap<String, PublicKeys>,
}

impl LocalSealingEngine {
    pub fn new(keyring: Arc<Keyring>) -> Self {
        Self {
            keyring,
            peers: DashMap::new(),
        }
    }

    pub fn trusts(&self, did: &str) -> bool {
        self.peers.contains_key(did)
    }

    fn local_did(&self, key: &KeyHandle) -> Result<String, SealError> {
        if !self.keyring.contains(key) {
            return Err(SealError::UnknownKey(*key));
        }
        self.keyring.did(key).ok_or(SealError::Unbound(*key))
    }
}

#[async_trait]
impl SealingEngine for LocalSealingEngine {
    fn trust_peer(&self, doc: &DidDocument) -> Result<(), SealError> {
        let keys = doc.public_keys().map_err(SealError::BadDocument)?;
        let previous = self.peers.insert(doc.id.clone(), keys);
        if previous.map(|p| p != keys).unwrap_or(true) {
            debug!(did = %doc.id, fingerprint = %keys.fingerprint(), "peer keys trusted");
        }
        Ok(())
    }

    async fn seal(&self, key: &KeyHandle, recipient_did: &str, payload: &[u8]) -> Result<Bytes, SealError> {
        let sender_did = self.local_did(key)?;
        let recipient = *self
            .peers
            .get(recipient_did)
            .ok_or_else(|| SealError::UnknownPeer(recipient_did.to_string()))?;

        let envelope = self
            .keyring
            .with_key(key, |material| {
                seal_envelope(
                    material,
                    &sender_did,
                    recipient_did,
                    &recipient.kex_pub,
                    payload,
                    unix_now(),
                )
            })
            .ok_or(SealError::UnknownKey(*key))?
            .map_err(|e| SealError::Rejected(e.to_string()))?;

        Ok(Bytes::from(encode_envelope(&envelope)))
    }

    async fn open(&self, key: &KeyHandle, envelope: &[u8]) -> Result<(String, Bytes), SealError> {
        let local_did = self.local_did(key)?;
        let envelope =
            decode_envelope(envelope).map_err(|e| SealError::Authentication(e.to_string()))?;
        let (sender_did, recipient_did) = peek_routing(&envelope)
            .map(|(s, r)| (s.to_string(), r.to_string()))
            .ok_or_else(|| SealError::Authentication("missing header".into()))?;

        if recipient_did != local_did {
            warn!(%recipient_did, %local_did, "misdirected envelope");
            return Err(SealError::Authentication(format!(
                "envelope addressed to {recipient_did}"
            )));
        }

        let sender = *self.peers.get(&sender_did).ok_or_else(|| {
            warn!(%sender_did, "envelope from untrusted sender");
            SealError::Authentication(format!("untrusted sender {sender_did}"))
        })?;

        let plaintext = self
            .keyring
            .with_key(key, |material| open_envelope(&envelope, material, &sender.sign_pub))
            .ok_or(SealError::UnknownKey(*key))?
            .map_err(|e| SealError::Authentication(e.to_string()))?;

        Ok((sender_did, Bytes::from(plaintext)))
    }
}
