use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

use super::signature::{CryptoError, SignatureVerifier};
use super::VerificationResult;

/// Size of the random salt prefixed to every server signature
pub const SALT_SIZE: usize = 16;

/// Size of the per-request nonce (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Generate a fresh base64 nonce for one outbound request.
///
/// Nonces are never reused or persisted.
pub fn create_random_nonce() -> String {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// Everything needed to verify one signed round trip.
///
/// Lives for a single request/response; built by the transport from the
/// nonce it sent and the headers it got back.
#[derive(Debug, Clone, Default)]
pub struct SignedRequestContext {
    pub path: String,
    pub nonce: String,
    pub signature: Option<String>,
    pub request_timestamp: Option<String>,
    pub body: Option<String>,
    pub etag: Option<String>,
}

impl SignedRequestContext {
    pub fn new(path: impl Into<String>, nonce: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            nonce: nonce.into(),
            ..Default::default()
        }
    }

    pub fn verify_with(&self, verifier: &ResponseVerifier) -> VerificationResult {
        verifier.verify_response(
            &self.path,
            self.signature.as_deref(),
            &self.nonce,
            self.body.as_deref(),
            self.request_timestamp.as_deref(),
            self.etag.as_deref(),
        )
    }
}

/// Checks server signatures against a fixed public key.
pub struct ResponseVerifier {
    signature_verifier: Arc<dyn SignatureVerifier>,
}

impl ResponseVerifier {
    pub fn new(signature_verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { signature_verifier }
    }

    /// Verify a response. Fails closed: any missing input is `Failed`.
    ///
    /// The body wins over the ETag when both are present; the ETag is only
    /// signed on its own for 304 responses that carry no body.
    pub fn verify_response(
        &self,
        path: &str,
        signature: Option<&str>,
        nonce: &str,
        body: Option<&str>,
        request_timestamp: Option<&str>,
        etag: Option<&str>,
    ) -> VerificationResult {
        let Some(signature) = signature else {
            tracing::warn!(path, "response is missing a signature");
            return VerificationResult::Failed;
        };
        let Some(request_timestamp) = request_timestamp else {
            tracing::warn!(path, "response is missing a request timestamp");
            return VerificationResult::Failed;
        };
        let Some(payload) = body.or(etag) else {
            tracing::warn!(path, "response has neither body nor etag to verify");
            return VerificationResult::Failed;
        };

        match self.check(signature, nonce, request_timestamp, payload) {
            Ok(()) => {
                tracing::debug!(path, "response signature verified");
                VerificationResult::Verified
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "response signature verification failed");
                VerificationResult::Failed
            }
        }
    }

    fn check(
        &self,
        signature: &str,
        nonce: &str,
        request_timestamp: &str,
        payload: &str,
    ) -> Result<(), CryptoError> {
        let decoded = BASE64.decode(signature)?;
        if decoded.len() <= SALT_SIZE {
            return Err(CryptoError::MalformedSignature(format!(
                "signature is {} bytes, expected more than {}",
                decoded.len(),
                SALT_SIZE
            )));
        }
        let (salt, sig) = decoded.split_at(SALT_SIZE);
        let nonce = BASE64.decode(nonce)?;

        let message = signed_message(salt, &nonce, request_timestamp, payload);
        self.signature_verifier.verify(sig, &message)
    }
}

impl std::fmt::Debug for ResponseVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseVerifier").finish_non_exhaustive()
    }
}

/// `salt || nonce || utf8(timestamp) || utf8(payload)`, byte for byte.
pub fn signed_message(
    salt: &[u8],
    nonce: &[u8],
    request_timestamp: &str,
    payload: &str,
) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(salt.len() + nonce.len() + request_timestamp.len() + payload.len());
    message.extend_from_slice(salt);
    message.extend_from_slice(nonce);
    message.extend_from_slice(request_timestamp.as_bytes());
    message.extend_from_slice(payload.as_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verification::Ed25519SignatureVerifier;
    use ed25519_dalek::{Signer, SigningKey};

    const TIMESTAMP: &str = "1700000000000";
    const BODY: &str = r#"{"subscriber":{"original_app_user_id":"alice"}}"#;

    fn verifier_for(key: &SigningKey) -> ResponseVerifier {
        ResponseVerifier::new(Arc::new(Ed25519SignatureVerifier::from_verifying_key(
            key.verifying_key(),
        )))
    }

    fn sign(
        key: &SigningKey,
        salt: [u8; SALT_SIZE],
        nonce: &str,
        ts: &str,
        payload: &str,
    ) -> String {
        let nonce = BASE64.decode(nonce).unwrap();
        let message = signed_message(&salt, &nonce, ts, payload);
        let sig = key.sign(&message);
        let mut out = salt.to_vec();
        out.extend_from_slice(&sig.to_bytes());
        BASE64.encode(out)
    }

    #[test]
    fn test_nonce_is_fresh_and_sized() {
        let a = create_random_nonce();
        let b = create_random_nonce();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_valid_body_signature_verifies() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let nonce = create_random_nonce();
        let signature = sign(&key, [9u8; SALT_SIZE], &nonce, TIMESTAMP, BODY);

        let result = verifier_for(&key).verify_response(
            "/v1/subscribers/alice",
            Some(&signature),
            &nonce,
            Some(BODY),
            Some(TIMESTAMP),
            None,
        );
        assert_eq!(result, VerificationResult::Verified);
    }

    #[test]
    fn test_etag_used_when_body_absent() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let nonce = create_random_nonce();
        let signature = sign(&key, [1u8; SALT_SIZE], &nonce, TIMESTAMP, "etag-123");

        let result = verifier_for(&key).verify_response(
            "/v1/subscribers/alice",
            Some(&signature),
            &nonce,
            None,
            Some(TIMESTAMP),
            Some("etag-123"),
        );
        assert_eq!(result, VerificationResult::Verified);
    }

    #[test]
    fn test_wrong_nonce_fails() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let nonce = create_random_nonce();
        let signature = sign(&key, [9u8; SALT_SIZE], &nonce, TIMESTAMP, BODY);

        let result = verifier_for(&key).verify_response(
            "/p",
            Some(&signature),
            &create_random_nonce(),
            Some(BODY),
            Some(TIMESTAMP),
            None,
        );
        assert_eq!(result, VerificationResult::Failed);
    }

    #[test]
    fn test_garbage_signature_fails_without_panicking() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let verifier = verifier_for(&key);
        let nonce = create_random_nonce();
        let salt_only = BASE64.encode([0u8; SALT_SIZE]);

        for sig in ["", "%%%", "AAAA", salt_only.as_str()] {
            let result = verifier.verify_response(
                "/p",
                Some(sig),
                &nonce,
                Some(BODY),
                Some(TIMESTAMP),
                None,
            );
            assert_eq!(result, VerificationResult::Failed, "signature {:?}", sig);
        }
    }

    #[test]
    fn test_context_delegates_to_verifier() {
        let key = SigningKey::from_bytes(&[42u8; 32]);
        let mut ctx = SignedRequestContext::new("/p", create_random_nonce());
        ctx.request_timestamp = Some(TIMESTAMP.to_string());
        ctx.body = Some(BODY.to_string());
        ctx.signature = Some(sign(&key, [3u8; SALT_SIZE], &ctx.nonce, TIMESTAMP, BODY));

        assert_eq!(ctx.verify_with(&verifier_for(&key)), VerificationResult::Verified);
    }
}
