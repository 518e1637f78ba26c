use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

/// Failure inside a signature primitive. Never leaves the verifier.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Pluggable asymmetric signature check.
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(())` only when `signature` is valid for `message`.
    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<(), CryptoError>;
}

/// Ed25519 verifier bound to a single public key.
#[derive(Debug, Clone)]
pub struct Ed25519SignatureVerifier {
    key: VerifyingKey,
}

impl Ed25519SignatureVerifier {
    /// Build from a base64-encoded 32-byte public key.
    pub fn from_base64(public_key: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(public_key.trim())?;
        let key_bytes: [u8; 32] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: bytes.len(),
                })?;
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self { key }
    }
}

impl SignatureVerifier for Ed25519SignatureVerifier {
    fn verify(&self, signature: &[u8], message: &[u8]) -> Result<(), CryptoError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
        self.key
            .verify(message, &signature)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}
