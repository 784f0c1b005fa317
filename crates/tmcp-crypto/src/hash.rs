use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Short hex fingerprint of a public key, for logs and display.
pub fn fingerprint(pubkey_bytes: &[u8]) -> String {
    sha256(pubkey_bytes)[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
