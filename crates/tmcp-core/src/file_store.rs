//! JSON file identity backend.
//!
//! All records live in one JSON file that is rewritten on every change:
//! written to a temp file, synced, renamed over the original, and on unix
//! restricted to the owner since it holds secret keys.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::store::{newest_active, IdentityBackend, IdentityRecord, StoreError};

#[derive(Default, Serialize, Deserialize)]
struct IdentityFile {
    identities: Vec<IdentityRecord>,
}

pub struct FileIdentityBackend {
    path: PathBuf,
    records: Mutex<HashMap<Uuid, IdentityRecord>>,
}

impl FileIdentityBackend {
    /// Open the store at `path`, reading existing records if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = if path.exists() {
            let contents = fs::read_to_string(&path)
                .map_err(|e| StoreError::OperationFailed(format!("failed to read {}: {e}", path.display())))?;
            let file: IdentityFile = serde_json::from_str(&contents)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            file.identities.into_iter().map(|r| (r.id, r)).collect()
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), records = records.len(), "identity file opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &HashMap<Uuid, IdentityRecord>) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::OperationFailed(e.to_string());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let mut identities: Vec<_> = records.values().cloned().collect();
        identities.sort_by_key(|r| r.created_at);
        let json = serde_json::to_string_pretty(&IdentityFile { identities })
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path).map_err(io_err)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).map_err(io_err)?;
        }

        Ok(())
    }
}

#[async_trait]
impl IdentityBackend for FileIdentityBackend {
    async fn save(&self, record: &IdentityRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let previous = records.insert(record.id, record.clone());
        if let Err(e) = self.persist(&records) {
            // keep memory in step with disk
            match previous {
                Some(previous) => records.insert(record.id, previous),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn active(&self, alias: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(newest_active(self.records.lock().await.values(), alias))
    }

    async fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let mut all: Vec<_> = self.records.lock().await.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        Ok(all)
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let removed = records
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Err(e) = self.persist(&records) {
            records.insert(id, removed);
            return Err(e);
        }
        Ok(())
    }
}
