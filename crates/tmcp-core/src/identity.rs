//! Identity store.
//!
//! Owns the local identities, one active identity per alias. Identities are
//! created on first use, persisted before they are published, and replaced
//! by a new identity (new DID) when the advertised transport kind changes.
//! An address change with the same kind republishes the same DID under the
//! next document version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tmcp_crypto::keys::KeyMaterial;
use tmcp_transport::TransportKind;

use crate::did::{DidRegistry, DocumentDraft, RegistryError};
use crate::errors::BridgeError;
use crate::keys::Keyring;
use crate::store::{IdentityBackend, IdentityRecord, StoreError};
use crate::types::{Advertisement, Identity, KeyHandle};

/// Public view of a stored identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityInfo {
    pub id: Uuid,
    pub alias: String,
    pub did: Option<String>,
    pub transport_kind: TransportKind,
    pub endpoint: String,
    pub document_version: u64,
    pub published: bool,
    pub fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl From<&IdentityRecord> for IdentityInfo {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            id: record.id,
            alias: record.alias.clone(),
            did: record.did.clone(),
            transport_kind: record.transport_kind,
            endpoint: record.endpoint.clone(),
            document_version: record.document_version,
            published: record.published,
            fingerprint: record
                .key_material()
                .ok()
                .map(|k| k.public_keys().fingerprint()),
            created_at: record.created_at,
            retired_at: record.retired_at,
        }
    }
}

pub struct IdentityStore {
    backend: Arc<dyn IdentityBackend>,
    registry: Arc<dyn DidRegistry>,
    keyring: Arc<Keyring>,
    // serializes load_or_create so one alias never races itself
    lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(
        backend: Arc<dyn IdentityBackend>,
        registry: Arc<dyn DidRegistry>,
        keyring: Arc<Keyring>,
    ) -> Self {
        Self {
            backend,
            registry,
            keyring,
            lock: Mutex::new(()),
        }
    }

    pub fn keyring(&self) -> &Arc<Keyring> {
        &self.keyring
    }

    /// Load the identity for `alias`, creating or republishing it as needed
    /// so that it advertises `advertisement`.
    pub async fn load_or_create(
        &self,
        alias: &str,
        advertisement: &Advertisement,
    ) -> Result<Identity, BridgeError> {
        let _guard = self.lock.lock().await;

        let Some(mut record) = self.backend.active(alias).await? else {
            debug!(%alias, "no identity for alias");
            return self.create(alias, advertisement).await;
        };

        if record.transport_kind != advertisement.kind {
            info!(
                %alias,
                did = ?record.did,
                old_kind = %record.transport_kind,
                new_kind = %advertisement.kind,
                "advertised transport kind changed, creating a new identity"
            );
            self.retire_record(record).await?;
            return self.create(alias, advertisement).await;
        }

        if !record.published {
            info!(%alias, id = %record.id, "resuming publication of pending identity");
            if record.endpoint != advertisement.address {
                record.endpoint = advertisement.address.clone();
                self.backend.save(&record).await?;
            }
            return self.publish(record).await;
        }

        let did = record.did.clone().ok_or_else(|| {
            StoreError::DataCorruption(format!("published identity {} has no DID", record.id))
        })?;
        let material = record.key_material()?;

        let document = match self.registry.resolve(&did).await {
            Ok(document) => document,
            Err(RegistryError::NotFound(_)) => {
                warn!(%alias, %did, "published DID is gone from the registry, creating a new identity");
                self.retire_record(record).await?;
                return self.create(alias, advertisement).await;
            }
            Err(e) => {
                return Err(BridgeError::UnresolvableDid {
                    did,
                    reason: e.to_string(),
                })
            }
        };
        if document.public_keys().ok() != Some(material.public_keys()) {
            return Err(BridgeError::UnresolvableDid {
                did,
                reason: "registry document carries different keys".into(),
            });
        }

        if record.endpoint != advertisement.address {
            info!(
                %alias,
                %did,
                old = %record.endpoint,
                new = %advertisement.address,
                "endpoint address changed, republishing"
            );
            record.endpoint = advertisement.address.clone();
            record.document_version = record.document_version.max(document.version) + 1;
            record.published = false;
            self.backend.save(&record).await?;
            return self.publish(record).await;
        }

        debug!(%alias, %did, "identity loaded");
        Ok(self.activate(&record, material))
    }

    /// The published identity for `alias`, if there is one.
    pub async fn get(&self, alias: &str) -> Result<Option<Identity>, BridgeError> {
        let Some(record) = self.backend.active(alias).await? else {
            return Ok(None);
        };
        if !record.published {
            return Ok(None);
        }
        let handle = KeyHandle(record.id);
        if self.keyring.contains(&handle) {
            return Ok(Some(to_identity(&record, handle)?));
        }
        let material = record.key_material()?;
        Ok(Some(self.activate(&record, material)))
    }

    pub async fn list(&self) -> Result<Vec<IdentityInfo>, BridgeError> {
        Ok(self
            .backend
            .list()
            .await?
            .iter()
            .map(IdentityInfo::from)
            .collect())
    }

    /// Mark an identity retired. Its record stays until deleted.
    pub async fn retire(&self, id: Uuid) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        let record = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.retire_record(record).await
    }

    /// Delete an identity and its keys. Operator action only.
    pub async fn delete(&self, id: Uuid) -> Result<(), BridgeError> {
        let _guard = self.lock.lock().await;
        self.backend.delete(id).await?;
        self.keyring.remove(&KeyHandle(id));
        info!(%id, "identity deleted");
        Ok(())
    }

    async fn create(&self, alias: &str, advertisement: &Advertisement) -> Result<Identity, BridgeError> {
        let material = KeyMaterial::generate();
        let record = IdentityRecord::new(alias, advertisement.kind, &advertisement.address, &material);
        self.backend.save(&record).await?;
        debug!(%alias, id = %record.id, "pending identity persisted");
        self.publish(record).await
    }

    async fn publish(&self, mut record: IdentityRecord) -> Result<Identity, BridgeError> {
        let material = record.key_material()?;
        let draft = DocumentDraft {
            did: record.did.clone(),
            name: registry_name(&record),
            advertisement: Advertisement::new(record.transport_kind, record.endpoint.clone()),
            keys: material.public_keys(),
            version: record.document_version,
        };

        let did = match self.registry.publish(&draft).await {
            Ok(did) => did,
            Err(e) => {
                if !self.already_published(&draft).await {
                    warn!(alias = %record.alias, error = %e, "publication failed");
                    return Err(BridgeError::PublicationFailed(e.to_string()));
                }
                debug!(alias = %record.alias, error = %e, "document was already published");
                draft.did.clone().unwrap_or_default()
            }
        };

        record.did = Some(did.clone());
        record.published = true;
        self.backend.save(&record).await?;
        info!(
            alias = %record.alias,
            %did,
            kind = %record.transport_kind,
            version = record.document_version,
            "identity published"
        );
        Ok(self.activate(&record, material))
    }

    /// A republication that reached the registry before a crash shows up as
    /// a rejected duplicate; detect it by comparing with what is there.
    async fn already_published(&self, draft: &DocumentDraft) -> bool {
        let Some(did) = draft.did.as_deref() else {
            return false;
        };
        match self.registry.resolve(did).await {
            Ok(doc) => {
                doc.version == draft.version
                    && doc.public_keys().ok() == Some(draft.keys)
                    && doc
                        .endpoint()
                        .map(|(kind, address)| {
                            kind == draft.advertisement.kind && address == draft.advertisement.address
                        })
                        .unwrap_or(false)
            }
            Err(_) => false,
        }
    }

    async fn retire_record(&self, mut record: IdentityRecord) -> Result<(), BridgeError> {
        record.retired_at = Some(Utc::now());
        self.backend.save(&record).await?;
        self.keyring.remove(&KeyHandle(record.id));
        info!(alias = %record.alias, did = ?record.did, "identity retired");
        Ok(())
    }

    fn activate(&self, record: &IdentityRecord, material: KeyMaterial) -> Identity {
        let handle = KeyHandle(record.id);
        self.keyring.insert(handle, material);
        if let Some(did) = &record.did {
            self.keyring.bind_did(&handle, did);
        }
        Identity {
            alias: record.alias.clone(),
            did: record.did.clone().unwrap_or_default(),
            transport_kind: record.transport_kind,
            endpoint: record.endpoint.clone(),
            document_version: record.document_version,
            key: handle,
        }
    }
}

fn to_identity(record: &IdentityRecord, handle: KeyHandle) -> Result<Identity, StoreError> {
    let did = record
        .did
        .clone()
        .ok_or_else(|| StoreError::DataCorruption(format!("published identity {} has no DID", record.id)))?;
    Ok(Identity {
        alias: record.alias.clone(),
        did,
        transport_kind: record.transport_kind,
        endpoint: record.endpoint.clone(),
        document_version: record.document_version,
        key: handle,
    })
}

/// Longest name the registry takes as a single DID path segment.
const MAX_REGISTRY_NAME: usize = 63;
const NAME_ID_LEN: usize = 8;

/// Registry name for a record: the alias made URL-safe plus a short id, so
/// each identity of an alias gets its own DID and retries reuse it. Long
/// aliases are cut so the id always survives.
fn registry_name(record: &IdentityRecord) -> String {
    let alias: String = record
        .alias
        .chars()
        .take(MAX_REGISTRY_NAME - NAME_ID_LEN - 1)
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let id = record.id.simple().to_string();
    format!("{alias}-{}", &id[..NAME_ID_LEN])
}
