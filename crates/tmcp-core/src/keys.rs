//! Key custody.
//!
//! The [`Keyring`] is the only place local key material lives at runtime.
//! Everything else refers to keys through a [`KeyHandle`]; operations that
//! need the secret run inside [`Keyring::with_key`], which lends a reference
//! for the duration of a closure and never hands the material out.

use dashmap::DashMap;

use tmcp_crypto::keys::{KeyMaterial, PublicKeys};

use crate::types::KeyHandle;

struct Custody {
    material: KeyMaterial,
    did: Option<String>,
}

#[derive(Default)]
pub struct Keyring {
    keys: DashMap<KeyHandle, Custody>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take custody of `material` under `handle`, replacing anything held
    /// there before.
    pub fn insert(&self, handle: KeyHandle, material: KeyMaterial) {
        self.keys.insert(
            handle,
            Custody {
                material,
                did: None,
            },
        );
    }

    /// Record the DID the keys under `handle` are published as.
    pub fn bind_did(&self, handle: &KeyHandle, did: &str) -> bool {
        match self.keys.get_mut(handle) {
            Some(mut custody) => {
                custody.did = Some(did.to_string());
                true
            }
            None => false,
        }
    }

    pub fn did(&self, handle: &KeyHandle) -> Option<String> {
        self.keys.get(handle).and_then(|c| c.did.clone())
    }

    pub fn public_keys(&self, handle: &KeyHandle) -> Option<PublicKeys> {
        self.keys.get(handle).map(|c| c.material.public_keys())
    }

    pub fn contains(&self, handle: &KeyHandle) -> bool {
        self.keys.contains_key(handle)
    }

    /// Run `f` with the key material under `handle`.
    ///
    /// `f` runs while a shard lock is held; it must not call back into the
    /// keyring.
    pub fn with_key<R>(&self, handle: &KeyHandle, f: impl FnOnce(&KeyMaterial) -> R) -> Option<R> {
        self.keys.get(handle).map(|c| f(&c.material))
    }

    /// Drop the key material under `handle`. Returns whether anything was held.
    pub fn remove(&self, handle: &KeyHandle) -> bool {
        self.keys.remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring").field("keys", &self.keys.len()).finish()
    }
}
