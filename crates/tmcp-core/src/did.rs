//! DID documents and the registry contract.
//!
//! The bridge only interprets two parts of a document: the service endpoint
//! (transport kind and address) and the verification keys. Everything else
//! is carried through untouched in [`DidDocument::extra`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tmcp_crypto::keys::PublicKeys;
use tmcp_transport::{scheme_kind, TransportKind};

use crate::config::RegistrySettings;
use crate::types::Advertisement;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub transport_kind: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationKeys {
    /// Hex-encoded Ed25519 public key.
    pub sign_pub: String,
    /// Hex-encoded X25519 public key.
    pub kex_pub: String,
}

impl From<&PublicKeys> for VerificationKeys {
    fn from(keys: &PublicKeys) -> Self {
        Self {
            sign_pub: hex::encode(keys.sign_pub),
            kex_pub: hex::encode(keys.kex_pub),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub service: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub verification: Option<VerificationKeys>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DidDocument {
    pub fn from_draft(did: &str, draft: &DocumentDraft) -> Self {
        Self {
            id: did.to_string(),
            version: draft.version,
            service: vec![ServiceEndpoint {
                transport_kind: draft.advertisement.kind.as_str().to_string(),
                address: draft.advertisement.address.clone(),
            }],
            verification: Some(VerificationKeys::from(&draft.keys)),
            extra: serde_json::Map::new(),
        }
    }

    /// The advertised transport kind and address.
    ///
    /// The first service entry is authoritative. Its kind must be known, its
    /// address must parse, and the address scheme, when it implies a kind,
    /// must agree with the declared one.
    pub fn endpoint(&self) -> Result<(TransportKind, &str), String> {
        let service = self
            .service
            .first()
            .ok_or_else(|| "document has no service endpoint".to_string())?;
        let kind: TransportKind = service
            .transport_kind
            .parse()
            .map_err(|_| format!("unknown transport kind {:?}", service.transport_kind))?;
        match scheme_kind(&service.address) {
            Ok(Some(implied)) if implied != kind => Err(format!(
                "address {} implies {implied}, document declares {kind}",
                service.address
            )),
            Ok(_) => Ok((kind, service.address.as_str())),
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn public_keys(&self) -> Result<PublicKeys, String> {
        let v = self
            .verification
            .as_ref()
            .ok_or_else(|| "document has no verification keys".to_string())?;
        let sign = hex::decode(&v.sign_pub).map_err(|_| "signPub is not hex".to_string())?;
        let kex = hex::decode(&v.kex_pub).map_err(|_| "kexPub is not hex".to_string())?;
        PublicKeys::from_slices(&sign, &kex).map_err(|e| e.to_string())
    }
}

/// What a local identity asks the registry to publish.
#[derive(Clone, Debug)]
pub struct DocumentDraft {
    /// `None` for a first publication; the registry assigns the DID.
    pub did: Option<String>,
    /// Registry name the DID is derived from.
    pub name: String,
    pub advertisement: Advertisement,
    pub keys: PublicKeys,
    pub version: u64,
}

#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("DID not found: {0}")]
    NotFound(String),

    #[error("registry rejected request: {0}")]
    Rejected(String),

    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("malformed registry response: {0}")]
    Malformed(String),
}

/// DID resolution and publication.
#[async_trait]
pub trait DidRegistry: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<DidDocument, RegistryError>;

    /// Publish a document and return its DID.
    async fn publish(&self, draft: &DocumentDraft) -> Result<String, RegistryError>;
}

/// In-process registry keeping every published version of every document.
pub struct MemoryDidRegistry {
    settings: RegistrySettings,
    documents: DashMap<String, Vec<DidDocument>>,
    offline: AtomicBool,
    resolve_delay: Mutex<Duration>,
    resolves: AtomicU64,
    publishes: AtomicU64,
}

impl MemoryDidRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            documents: DashMap::new(),
            offline: AtomicBool::new(false),
            resolve_delay: Mutex::new(Duration::ZERO),
            resolves: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
        }
    }

    /// While offline every call fails with [`RegistryError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every resolution, to make concurrent lookups overlap.
    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock() = delay;
    }

    /// Store a document verbatim, bypassing publication checks.
    pub fn insert_document(&self, doc: DidDocument) {
        self.documents.entry(doc.id.clone()).or_default().push(doc);
    }

    /// Forget a DID entirely.
    pub fn remove(&self, did: &str) -> bool {
        self.documents.remove(did).is_some()
    }

    /// Every version published under `did`, oldest first.
    pub fn history(&self, did: &str) -> Vec<DidDocument> {
        self.documents
            .get(did)
            .map(|versions| versions.clone())
            .unwrap_or_default()
    }

    pub fn resolve_count(&self) -> u64 {
        self.resolves.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> u64 {
        self.publishes.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), RegistryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("registry offline".into()));
        }
        Ok(())
    }
}

impl Default for MemoryDidRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

fn same_keys(doc: &DidDocument, keys: &PublicKeys) -> bool {
    doc.public_keys().map(|k| k == *keys).unwrap_or(false)
}

#[async_trait]
impl DidRegistry for MemoryDidRegistry {
    async fn resolve(&self, did: &str) -> Result<DidDocument, RegistryError> {
        self.resolves.fetch_add(1, Ordering::SeqCst);
        let delay = *self.resolve_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_online()?;
        self.documents
            .get(did)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| RegistryError::NotFound(did.to_string()))
    }

    async fn publish(&self, draft: &DocumentDraft) -> Result<String, RegistryError> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let did = match &draft.did {
            Some(did) => did.clone(),
            None => self.settings.did_for_name(&draft.name),
        };

        let mut versions = self.documents.entry(did.clone()).or_default();
        if let Some(latest) = versions.last() {
            if !same_keys(latest, &draft.keys) {
                return Err(RegistryError::Rejected(format!(
                    "{did} is bound to different keys"
                )));
            }
            if draft.did.is_none() {
                // same keys publishing the same name again: already done
                return Ok(did);
            }
            if draft.version <= latest.version {
                return Err(RegistryError::Rejected(format!(
                    "version {} is not newer than {}",
                    draft.version, latest.version
                )));
            }
        } else if draft.did.is_some() {
            drop(versions);
            self.documents.remove_if(&did, |_, v| v.is_empty());
            return Err(RegistryError::NotFound(did));
        }

        versions.push(DidDocument::from_draft(&did, draft));
        tracing::debug!(%did, version = draft.version, "document published to memory registry");
        Ok(did)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmcp_crypto::keys::KeyMaterial;

    fn draft(name: &str, kind: TransportKind, address: &str, keys: PublicKeys) -> DocumentDraft {
        DocumentDraft {
            did: None,
            name: name.to_string(),
            advertisement: Advertisement::new(kind, address),
            keys,
            version: 1,
        }
    }

    #[test]
    fn test_document_json_shape() {
        let keys = KeyMaterial::generate().public_keys();
        let doc = DidDocument::from_draft(
            "did:web:did.teaspoon.world:endpoint:demo",
            &draft("demo", TransportKind::PushStream, "sse://localhost:8000/sse", keys),
        );
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["service"][0]["transportKind"], "push-stream");
        assert_eq!(json["verification"]["signPub"], hex::encode(keys.sign_pub));

        let back: DidDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.public_keys().unwrap(), keys);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let doc: DidDocument = serde_json::from_str(
            r#"{"id":"did:web:x","version":2,"service":[{"transportKind":"bidirectional-socket","address":"wss://x/ws"}],"@context":["https://www.w3.org/ns/did/v1"]}"#,
        )
        .unwrap();
        assert!(doc.extra.contains_key("@context"));
        assert_eq!(doc.endpoint().unwrap(), (TransportKind::BidirectionalSocket, "wss://x/ws"));
    }

    #[test]
    fn test_malformed_endpoints() {
        let mut doc: DidDocument =
            serde_json::from_str(r#"{"id":"did:web:x","service":[]}"#).unwrap();
        assert!(doc.endpoint().is_err());

        doc.service.push(ServiceEndpoint {
            transport_kind: "carrier-pigeon".into(),
            address: "sse://x".into(),
        });
        assert!(doc.endpoint().is_err());

        doc.service[0].transport_kind = "bidirectional-socket".into();
        // sse:// contradicts the declared kind
        assert!(doc.endpoint().is_err());

        doc.service[0].address = "tmcpclient://".into();
        assert_eq!(doc.endpoint().unwrap().0, TransportKind::BidirectionalSocket);
    }

    #[tokio::test]
    async fn test_publish_then_resolve() {
        let registry = MemoryDidRegistry::default();
        let keys = KeyMaterial::generate().public_keys();
        let did = registry
            .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", keys))
            .await
            .unwrap();
        assert_eq!(did, "did:web:did.teaspoon.world:endpoint:demo");

        let doc = registry.resolve(&did).await.unwrap();
        assert_eq!(doc.version, 1);
        assert!(matches!(
            registry.resolve("did:web:nobody").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_name_taken_by_other_keys() {
        let registry = MemoryDidRegistry::default();
        let a = KeyMaterial::generate().public_keys();
        let b = KeyMaterial::generate().public_keys();
        registry
            .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", a))
            .await
            .unwrap();

        // same keys again is idempotent
        registry
            .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", a))
            .await
            .unwrap();
        assert_eq!(registry.history("did:web:did.teaspoon.world:endpoint:demo").len(), 1);

        assert!(matches!(
            registry
                .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", b))
                .await,
            Err(RegistryError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_republish_requires_newer_version() {
        let registry = MemoryDidRegistry::default();
        let keys = KeyMaterial::generate().public_keys();
        let did = registry
            .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", keys))
            .await
            .unwrap();

        let mut update = draft("demo", TransportKind::PushStream, "sse://h2/sse", keys);
        update.did = Some(did.clone());
        assert!(matches!(registry.publish(&update).await, Err(RegistryError::Rejected(_))));

        update.version = 2;
        registry.publish(&update).await.unwrap();
        assert_eq!(registry.history(&did).len(), 2);
        assert_eq!(registry.resolve(&did).await.unwrap().endpoint().unwrap().1, "sse://h2/sse");
    }

    #[tokio::test]
    async fn test_offline_registry() {
        let registry = MemoryDidRegistry::default();
        registry.set_offline(true);
        let keys = KeyMaterial::generate().public_keys();
        assert!(matches!(
            registry
                .publish(&draft("demo", TransportKind::PushStream, "sse://h/sse", keys))
                .await,
            Err(RegistryError::Unavailable(_))
        ));
    }
}
