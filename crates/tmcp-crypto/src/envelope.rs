//! Sign-then-encrypt envelopes addressed by DID.
//!
//! The payload is sealed to the recipient's X25519 key with an ephemeral
//! sender key (X25519 + HKDF-SHA256 + ChaCha20Poly1305) and the whole
//! envelope is signed with the sender's Ed25519 key. The header carries the
//! sender and recipient DIDs in the clear so that a receiver can pick the
//! verification key before decrypting.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use prost::Message;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::keys::{verify_signature, KeyMaterial};
use crate::transcript::Transcript;
use tmcp_proto::v1::{EnvelopeHeaderV1, EnvelopeV1, ENVELOPE_VERSION};
use tmcp_proto::Validate;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error("signature verification failed")]
    BadSignature,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("encryption failed")]
    EncryptFailed,
}

/// AAD bound into the AEAD and carried in `envelope.aad`.
pub fn envelope_aad_v1(header: &EnvelopeHeaderV1) -> Vec<u8> {
    let mut t = Transcript::new("tmcp_env_aad_v1");
    t.append_str(1, &header.sender_did);
    t.append_str(2, &header.recipient_did);
    t.append_u64(3, header.timestamp);
    t.append_bytes(4, &header.nonce);
    t.as_bytes().to_vec()
}

fn signature_input(
    header: &EnvelopeHeaderV1,
    sender_kex_pub: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> [u8; 32] {
    let mut t = Transcript::new("tmcp_env_sig_v1");
    t.append_u64(1, header.version as u64);
    t.append_str(2, &header.sender_did);
    t.append_str(3, &header.recipient_did);
    t.append_u64(4, header.timestamp);
    t.append_bytes(5, &header.nonce);
    t.append_bytes(6, sender_kex_pub);
    t.append_bytes(7, aad);
    t.append_bytes(8, ciphertext);
    t.digest()
}

fn kdf_key_nonce(shared_secret: &[u8; 32], salt: &[u8]) -> Option<([u8; 32], [u8; 12])> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    hk.expand(b"tmcp_env_v1_key", &mut key).ok()?;
    hk.expand(b"tmcp_env_v1_nonce", &mut nonce).ok()?;
    Some((key, nonce))
}

/// Seal `plaintext` from `sender_did` to `recipient_did`.
pub fn seal_envelope(
    sender: &KeyMaterial,
    sender_did: &str,
    recipient_did: &str,
    recipient_kex_pub: &[u8; 32],
    plaintext: &[u8],
    now_unix: u64,
) -> Result<EnvelopeV1, EnvelopeError> {
    let mut nonce24 = [0u8; 24];
    getrandom::getrandom(&mut nonce24).map_err(|_| EnvelopeError::EncryptFailed)?;

    let header = EnvelopeHeaderV1 {
        version: ENVELOPE_VERSION,
        sender_did: sender_did.to_string(),
        recipient_did: recipient_did.to_string(),
        timestamp: now_unix,
        nonce: nonce24.to_vec(),
    };
    let aad = envelope_aad_v1(&header);

    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&X25519PublicKey::from(*recipient_kex_pub));

    let (key32, nonce12) =
        kdf_key_nonce(shared.as_bytes(), &nonce24).ok_or(EnvelopeError::EncryptFailed)?;
    let ct = ChaCha20Poly1305::new(Key::from_slice(&key32))
        .encrypt(Nonce::from_slice(&nonce12), Payload { msg: plaintext, aad: &aad })
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let sender_kex_pub = eph_pub.as_bytes().to_vec();
    let signature = sender.sign(&signature_input(&header, &sender_kex_pub, &aad, &ct));

    Ok(EnvelopeV1 {
        header: Some(header),
        sender_kex_pub,
        encrypted_payload: ct,
        signature: signature.to_vec(),
        aad,
    })
}

/// Verify the signature with `sender_sign_pub`, then decrypt with the
/// recipient's key material. The signature is checked before any decryption.
pub fn open_envelope(
    env: &EnvelopeV1,
    recipient: &KeyMaterial,
    sender_sign_pub: &[u8; 32],
) -> Result<Vec<u8>, EnvelopeError> {
    env.validate()
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let header = env
        .header
        .as_ref()
        .ok_or_else(|| EnvelopeError::Malformed("missing header".into()))?;

    let sig_input = signature_input(header, &env.sender_kex_pub, &env.aad, &env.encrypted_payload);
    verify_signature(sender_sign_pub, &sig_input, &env.signature)
        .map_err(|_| EnvelopeError::BadSignature)?;

    if envelope_aad_v1(header) != env.aad {
        return Err(EnvelopeError::BadSignature);
    }

    let eph_pub: [u8; 32] = env
        .sender_kex_pub
        .as_slice()
        .try_into()
        .map_err(|_| EnvelopeError::InvalidKeyBytes)?;
    let shared = recipient
        .kex_secret()
        .diffie_hellman(&X25519PublicKey::from(eph_pub));

    let (key32, nonce12) =
        kdf_key_nonce(shared.as_bytes(), &header.nonce).ok_or(EnvelopeError::DecryptFailed)?;
    ChaCha20Poly1305::new(Key::from_slice(&key32))
        .decrypt(
            Nonce::from_slice(&nonce12),
            Payload { msg: &env.encrypted_payload, aad: &env.aad },
        )
        .map_err(|_| EnvelopeError::DecryptFailed)
}

pub fn encode_envelope(env: &EnvelopeV1) -> Vec<u8> {
    env.encode_to_vec()
}

/// Decode and structurally validate wire bytes.
pub fn decode_envelope(bytes: &[u8]) -> Result<EnvelopeV1, EnvelopeError> {
    let env = EnvelopeV1::decode(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    env.validate()
        .map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    Ok(env)
}

/// Read `(sender_did, recipient_did)` without verifying anything.
pub fn peek_routing(env: &EnvelopeV1) -> Option<(&str, &str)> {
    env.header
        .as_ref()
        .map(|h| (h.sender_did.as_str(), h.recipient_did.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "did:web:did.example.org:endpoint:alice";
    const BOB: &str = "did:web:did.example.org:endpoint:bob";

    #[test]
    fn test_envelope_round_trip() {
        let alice = KeyMaterial::generate();
        let bob = KeyMaterial::generate();

        let env = seal_envelope(
            &alice,
            ALICE,
            BOB,
            &bob.public_keys().kex_pub,
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#,
            1_700_000_000,
        )
        .unwrap();

        let wire = encode_envelope(&env);
        let decoded = decode_envelope(&wire).unwrap();
        assert_eq!(peek_routing(&decoded), Some((ALICE, BOB)));

        let pt = open_envelope(&decoded, &bob, &alice.public_keys().sign_pub).unwrap();
        assert_eq!(pt, br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#);
    }

    #[test]
    fn test_wrong_recipient_cannot_decrypt() {
        let alice = KeyMaterial::generate();
        let bob = KeyMaterial::generate();
        let eve = KeyMaterial::generate();

        let env = seal_envelope(&alice, ALICE, BOB, &bob.public_keys().kex_pub, b"hi", 1).unwrap();
        let err = open_envelope(&env, &eve, &alice.public_keys().sign_pub).unwrap_err();
        assert!(matches!(err, EnvelopeError::DecryptFailed));
    }

    #[test]
    fn test_rewritten_sender_fails_signature() {
        let alice = KeyMaterial::generate();
        let bob = KeyMaterial::generate();

        let mut env = seal_envelope(&alice, ALICE, BOB, &bob.public_keys().kex_pub, b"hi", 1).unwrap();
        if let Some(h) = env.header.as_mut() {
            h.sender_did = "did:web:did.example.org:endpoint:mallory".into();
        }
        let err = open_envelope(&env, &bob, &alice.public_keys().sign_pub).unwrap_err();
        assert!(matches!(err, EnvelopeError::BadSignature));
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_envelope(b"\xff\xff\xff"),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
