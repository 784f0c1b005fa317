//! Structural validation for envelope messages.
//!
//! Validation only checks sizes and presence. Cryptographic checks live in
//! `tmcp-crypto`.

use crate::v1::*;

/// Validation error types for wire messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Field has invalid size (expected, actual)
    InvalidSize { field: &'static str, expected: usize, actual: usize },
    /// Required field is empty or absent
    EmptyField { field: &'static str },
    /// Unsupported wire version
    UnsupportedVersion { version: u32 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidSize { field, expected, actual } => {
                write!(f, "field '{}' has invalid size: expected {}, got {}", field, expected, actual)
            }
            Self::EmptyField { field } => write!(f, "required field '{}' is empty", field),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported envelope version {}", version)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Structural validation of a decoded message.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

fn check_size(field: &'static str, bytes: &[u8], expected: usize) -> Result<(), ValidationError> {
    if bytes.len() != expected {
        return Err(ValidationError::InvalidSize { field, expected, actual: bytes.len() });
    }
    Ok(())
}

impl Validate for EnvelopeHeaderV1 {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.version != ENVELOPE_VERSION {
            return Err(ValidationError::UnsupportedVersion { version: self.version });
        }
        if self.sender_did.is_empty() {
            return Err(ValidationError::EmptyField { field: "sender_did" });
        }
        if self.recipient_did.is_empty() {
            return Err(ValidationError::EmptyField { field: "recipient_did" });
        }
        check_size("nonce", &self.nonce, 24)
    }
}

impl Validate for EnvelopeV1 {
    fn validate(&self) -> Result<(), ValidationError> {
        self.header
            .as_ref()
            .ok_or(ValidationError::EmptyField { field: "header" })?
            .validate()?;
        check_size("sender_kex_pub", &self.sender_kex_pub, 32)?;
        check_size("signature", &self.signature, 64)?;
        if self.encrypted_payload.is_empty() {
            return Err(ValidationError::EmptyField { field: "encrypted_payload" });
        }
        Ok(())
    }
}
