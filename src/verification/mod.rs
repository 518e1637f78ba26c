//! Response integrity verification.
//!
//! Every response that carries entitlement data can be signed by the server.
//! The signature covers a random salt, the nonce we sent with the request,
//! the server's request timestamp and the body (or the ETag for a 304):
//!
//! ```text
//! base64decode(signature) = salt[16] || sig[..]
//! message                 = salt || base64decode(nonce) || utf8(timestamp) || utf8(body or etag)
//! ```
//!
//! Verification never throws. A bad or missing signature produces
//! [`VerificationResult::Failed`], and the caller decides what that means
//! based on the configured [`VerificationMode`].

mod response;
mod signature;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use response::{
    create_random_nonce, signed_message, ResponseVerifier, SignedRequestContext, NONCE_SIZE,
    SALT_SIZE,
};
pub use signature::{CryptoError, Ed25519SignatureVerifier, SignatureVerifier};

/// Outcome of verifying one response. Stored next to any data derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    /// Verification was disabled when the data was fetched
    #[default]
    NotRequested,
    Verified,
    Failed,
}

impl VerificationResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// How responses are verified, fixed for the lifetime of the process.
#[derive(Clone, Default)]
pub enum VerificationMode {
    #[default]
    Disabled,
    /// Verify and report, but keep using data that failed
    Informational(Arc<ResponseVerifier>),
    /// Verify and refuse data that failed
    Enforced(Arc<ResponseVerifier>),
}

impl VerificationMode {
    pub fn should_verify(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn verifier(&self) -> Option<&ResponseVerifier> {
        match self {
            Self::Disabled => None,
            Self::Informational(v) | Self::Enforced(v) => Some(v),
        }
    }

    pub fn is_enforced(&self) -> bool {
        matches!(self, Self::Enforced(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Informational(_) => "informational",
            Self::Enforced(_) => "enforced",
        }
    }
}

impl std::fmt::Debug for VerificationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> Arc<ResponseVerifier> {
        let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        Arc::new(ResponseVerifier::new(Arc::new(
            Ed25519SignatureVerifier::from_verifying_key(key.verifying_key()),
        )))
    }

    #[test]
    fn test_should_verify_for_every_mode_but_disabled() {
        assert!(!VerificationMode::Disabled.should_verify());
        assert!(VerificationMode::Informational(verifier()).should_verify());
        assert!(VerificationMode::Enforced(verifier()).should_verify());
    }

    #[test]
    fn test_verifier_only_when_enabled() {
        assert!(VerificationMode::Disabled.verifier().is_none());
        assert!(VerificationMode::Informational(verifier()).verifier().is_some());
        assert!(!VerificationMode::Informational(verifier()).is_enforced());
        assert!(VerificationMode::Enforced(verifier()).is_enforced());
    }

    #[test]
    fn test_result_serialization() {
        assert_eq!(
            serde_json::to_string(&VerificationResult::NotRequested).unwrap(),
            "\"NOT_REQUESTED\""
        );
        let parsed: VerificationResult = serde_json::from_str("\"VERIFIED\"").unwrap();
        assert_eq!(parsed, VerificationResult::Verified);
    }
}
