//! Identity store wiring for the CLI.
//!
//! Commands that touch local identities open the configured backend (JSON
//! file or SQLite) and publish through the HTTP DID registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::debug;

use tmcp_core::did::DidRegistry;
use tmcp_core::file_store::FileIdentityBackend;
use tmcp_core::http_registry::HttpDidRegistry;
use tmcp_core::keys::Keyring;
use tmcp_core::sqlite_store::SqliteIdentityBackend;
use tmcp_core::store::IdentityBackend;
use tmcp_core::{DidResolver, IdentityStore};

use crate::config::Config;

/// Open the identity backend named by the configuration.
pub fn open_backend(config: &Config) -> anyhow::Result<(Arc<dyn IdentityBackend>, PathBuf)> {
    let path = config
        .identity_store_path()
        .context("no identity store path configured and no data directory available")?;

    let backend: Arc<dyn IdentityBackend> = match config.identity.backend.as_str() {
        "sqlite" => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            Arc::new(SqliteIdentityBackend::new(&path)?)
        }
        _ => Arc::new(FileIdentityBackend::open(&path)?),
    };
    debug!(backend = %config.identity.backend, path = %path.display(), "identity backend opened");
    Ok((backend, path))
}

/// The HTTP registry for the configured endpoints.
pub fn registry(config: &Config) -> anyhow::Result<Arc<dyn DidRegistry>> {
    Ok(Arc::new(HttpDidRegistry::new(config.registry.clone())?))
}

/// An identity store over the configured backend and the HTTP registry.
pub fn open_store(config: &Config) -> anyhow::Result<(IdentityStore, PathBuf)> {
    let (backend, path) = open_backend(config)?;
    let store = IdentityStore::new(backend, registry(config)?, Arc::new(Keyring::new()));
    Ok((store, path))
}

/// A resolver over the HTTP registry.
pub fn resolver(config: &Config) -> anyhow::Result<DidResolver> {
    Ok(DidResolver::new(registry(config)?, config.resolver.freshness()))
}
