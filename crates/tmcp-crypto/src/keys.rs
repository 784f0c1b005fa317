//! Key material for a local identity.
//!
//! Holds an Ed25519 signing key and an X25519 key agreement secret. Both
//! inner types zeroize themselves on drop; exported secret bytes are wrapped
//! in [`Zeroizing`] so copies do not linger either.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::hash::fingerprint;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// Public half of a [`KeyMaterial`], safe to publish in a DID document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKeys {
    pub sign_pub: [u8; 32],
    pub kex_pub: [u8; 32],
}

impl PublicKeys {
    pub fn from_slices(sign_pub: &[u8], kex_pub: &[u8]) -> Result<Self, KeyError> {
        let sign_pub: [u8; 32] = sign_pub
            .try_into()
            .map_err(|_| KeyError::InvalidKeyLength { expected: 32, got: sign_pub.len() })?;
        let kex_pub: [u8; 32] = kex_pub
            .try_into()
            .map_err(|_| KeyError::InvalidKeyLength { expected: 32, got: kex_pub.len() })?;
        // Reject points that can never verify.
        VerifyingKey::from_bytes(&sign_pub).map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self { sign_pub, kex_pub })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.sign_pub)
    }
}

pub struct KeyMaterial {
    sign_key: SigningKey,
    kex_key: StaticSecret,
}

impl KeyMaterial {
    pub fn generate() -> Self {
        Self {
            sign_key: SigningKey::generate(&mut OsRng),
            kex_key: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Rebuild key material from persisted secret bytes.
    pub fn from_secret_bytes(sign_seed: &[u8; 32], kex_secret: &[u8; 32]) -> Self {
        Self {
            sign_key: SigningKey::from_bytes(sign_seed),
            kex_key: StaticSecret::from(*kex_secret),
        }
    }

    pub fn sign_seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.sign_key.to_bytes())
    }

    pub fn kex_secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.kex_key.to_bytes())
    }

    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            sign_pub: self.sign_key.verifying_key().to_bytes(),
            kex_pub: *X25519PublicKey::from(&self.kex_key).as_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let signature: Signature = self.sign_key.sign(message);
        signature.to_bytes()
    }

    pub(crate) fn kex_secret(&self) -> &StaticSecret {
        &self.kex_key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("fingerprint", &self.public_keys().fingerprint())
            .finish_non_exhaustive()
    }
}

pub fn verify_signature(
    sign_pub: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), KeyError> {
    let vk = VerifyingKey::from_bytes(sign_pub).map_err(|_| KeyError::InvalidPublicKey)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| KeyError::InvalidKeyLength { expected: 64, got: signature.len() })?;
    vk.verify_strict(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| KeyError::InvalidSignature)
}
