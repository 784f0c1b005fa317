//! Version 1 envelope messages.

/// Current envelope wire version.
pub const ENVELOPE_VERSION: u32 = 1;

/// Routing header of a sealed envelope.
///
/// Every field is covered by the envelope signature and used as AEAD
/// associated data, so routing can be read before opening but not altered.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeHeaderV1 {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub sender_did: String,
    #[prost(string, tag = "3")]
    pub recipient_did: String,
    /// Unix seconds at sealing time.
    #[prost(uint64, tag = "4")]
    pub timestamp: u64,
    /// 24 random bytes; HKDF salt for the payload key.
    #[prost(bytes = "vec", tag = "5")]
    pub nonce: Vec<u8>,
}

/// A sealed envelope as it crosses a transport.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnvelopeV1 {
    #[prost(message, optional, tag = "1")]
    pub header: Option<EnvelopeHeaderV1>,
    /// Sender ephemeral X25519 public key (32 bytes).
    #[prost(bytes = "vec", tag = "2")]
    pub sender_kex_pub: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub encrypted_payload: Vec<u8>,
    /// Ed25519 signature over the header, ephemeral key, aad and ciphertext.
    #[prost(bytes = "vec", tag = "4")]
    pub signature: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub aad: Vec<u8>,
}

/// Plaintext carried inside an envelope: the protocol message plus the
/// per-session sequence number that orders it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequencedPayloadV1 {
    #[prost(uint64, tag = "1")]
    pub sequence: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
}
