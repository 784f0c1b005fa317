//! Persistence for local identities.
//!
//! This module defines the [`IdentityBackend`] trait and an in-memory
//! implementation for tests and ephemeral use. Durable backends live in
//! [`file_store`](crate::file_store) and, behind the `sqlite` feature,
//! `sqlite_store`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;
use zeroize::Zeroizing;

use tmcp_crypto::keys::KeyMaterial;
use tmcp_transport::TransportKind;

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),

    #[error("data corruption detected: {0}")]
    DataCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A persisted identity, including its secret key bytes.
///
/// A record is written before its document is published (`published ==
/// false`) so the keys survive a crash between the two steps.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub alias: String,
    /// Assigned by the registry on first publication.
    pub did: Option<String>,
    pub transport_kind: TransportKind,
    pub endpoint: String,
    pub document_version: u64,
    pub published: bool,
    /// Hex-encoded Ed25519 seed.
    pub sign_seed: String,
    /// Hex-encoded X25519 secret.
    pub kex_secret: String,
    pub created_at: DateTime<Utc>,
    /// Set when the identity is superseded. Retired records are kept until
    /// an operator deletes them.
    pub retired_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    pub fn new(
        alias: &str,
        transport_kind: TransportKind,
        endpoint: &str,
        material: &KeyMaterial,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alias: alias.to_string(),
            did: None,
            transport_kind,
            endpoint: endpoint.to_string(),
            document_version: 1,
            published: false,
            sign_seed: hex::encode(&*material.sign_seed()),
            kex_secret: hex::encode(&*material.kex_secret_bytes()),
            created_at: Utc::now(),
            retired_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Rebuild the key material held in this record.
    pub fn key_material(&self) -> Result<KeyMaterial, StoreError> {
        let sign_seed = decode_secret(&self.sign_seed, "sign_seed")?;
        let kex_secret = decode_secret(&self.kex_secret, "kex_secret")?;
        Ok(KeyMaterial::from_secret_bytes(&sign_seed, &kex_secret))
    }
}

fn decode_secret(hex_str: &str, field: &str) -> Result<Zeroizing<[u8; 32]>, StoreError> {
    let bytes = Zeroizing::new(
        hex::decode(hex_str).map_err(|_| StoreError::DataCorruption(format!("{field} is not hex")))?,
    );
    let mut out = Zeroizing::new([0u8; 32]);
    if bytes.len() != 32 {
        return Err(StoreError::DataCorruption(format!(
            "{field} has {} bytes, expected 32",
            bytes.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl std::fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("id", &self.id)
            .field("alias", &self.alias)
            .field("did", &self.did)
            .field("transport_kind", &self.transport_kind)
            .field("endpoint", &self.endpoint)
            .field("document_version", &self.document_version)
            .field("published", &self.published)
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

/// Storage abstraction for identity records.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Insert or replace the record with `record.id`.
    async fn save(&self, record: &IdentityRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<IdentityRecord>, StoreError>;

    /// The newest non-retired record for `alias`.
    async fn active(&self, alias: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// All records, retired ones included, oldest first.
    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// Pick the newest active record for an alias.
pub(crate) fn newest_active<'a>(
    records: impl Iterator<Item = &'a IdentityRecord>,
    alias: &str,
) -> Option<IdentityRecord> {
    records
        .filter(|r| r.alias == alias && r.is_active())
        .max_by_key(|r| r.created_at)
        .cloned()
}

/// In-memory identity backend.
#[derive(Default)]
pub struct InMemoryIdentityBackend {
    records: RwLock<HashMap<Uuid, IdentityRecord>>,
}

impl InMemoryIdentityBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityBackend for InMemoryIdentityBackend {
    async fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn active(&self, alias: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(newest_active(self.records.read().await.values(), alias))
    }

    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
