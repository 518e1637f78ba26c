//! Response signature verification properties.

mod common;

use common::*;
use purchases_core::verification::{create_random_nonce, NONCE_SIZE};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const PATH: &str = "/v1/subscribers/alice";

fn sample_inputs() -> Vec<([u8; SALT_SIZE], String, &'static str, String)> {
    vec![
        ([0u8; SALT_SIZE], create_random_nonce(), TIMESTAMP, "{}".to_string()),
        (
            [0xAB; SALT_SIZE],
            create_random_nonce(),
            "1",
            customer_info_body("alice", &[("pro", None)]),
        ),
        (
            [7u8; SALT_SIZE],
            BASE64.encode([0u8; NONCE_SIZE]),
            "1712345678901",
            "ünïcödé body ✓".to_string(),
        ),
    ]
}

#[test]
fn test_signed_response_round_trips() {
    let key = server_key();
    let verifier = response_verifier(&key);

    for (salt, nonce, ts, body) in sample_inputs() {
        let signature = sign_payload(&key, salt, &nonce, ts, &body);
        let result = verifier.verify_response(
            PATH,
            Some(signature.as_str()),
            &nonce,
            Some(body.as_str()),
            Some(ts),
            None,
        );
        assert_eq!(result, VerificationResult::Verified, "body {:?}", body);
    }
}

#[test]
fn test_different_key_fails() {
    let verifier = response_verifier(&server_key());

    for (salt, nonce, ts, body) in sample_inputs() {
        let signature = sign_payload(&other_key(), salt, &nonce, ts, &body);
        let result = verifier.verify_response(
            PATH,
            Some(signature.as_str()),
            &nonce,
            Some(body.as_str()),
            Some(ts),
            None,
        );
        assert_eq!(result, VerificationResult::Failed);
    }
}

#[test]
fn test_any_altered_byte_fails() {
    let key = server_key();
    let verifier = response_verifier(&key);
    let nonce = create_random_nonce();
    let body = customer_info_body("alice", &[("pro", None)]);
    let signature = sign_payload(&key, [5u8; SALT_SIZE], &nonce, TIMESTAMP, &body);

    // Every single-byte change to the body.
    for i in 0..body.len() {
        let mut altered = body.clone().into_bytes();
        altered[i] ^= 0x01;
        let Ok(altered) = String::from_utf8(altered) else {
            continue;
        };
        let result = verifier.verify_response(
            PATH,
            Some(signature.as_str()),
            &nonce,
            Some(altered.as_str()),
            Some(TIMESTAMP),
            None,
        );
        assert_eq!(result, VerificationResult::Failed, "body byte {}", i);
    }

    // Timestamp.
    let result = verifier.verify_response(
        PATH,
        Some(signature.as_str()),
        &nonce,
        Some(body.as_str()),
        Some("1700000000001"),
        None,
    );
    assert_eq!(result, VerificationResult::Failed);

    // Every byte of salt and signature.
    let raw = BASE64.decode(&signature).unwrap();
    for i in 0..raw.len() {
        let mut altered = raw.clone();
        altered[i] ^= 0x80;
        let altered = BASE64.encode(altered);
        let result = verifier.verify_response(
            PATH,
            Some(altered.as_str()),
            &nonce,
            Some(body.as_str()),
            Some(TIMESTAMP),
            None,
        );
        assert_eq!(result, VerificationResult::Failed, "signature byte {}", i);
    }

    // Every byte of the nonce.
    let raw_nonce = BASE64.decode(&nonce).unwrap();
    for i in 0..raw_nonce.len() {
        let mut altered = raw_nonce.clone();
        altered[i] ^= 0x01;
        let altered = BASE64.encode(altered);
        let result = verifier.verify_response(
            PATH,
            Some(signature.as_str()),
            &altered,
            Some(body.as_str()),
            Some(TIMESTAMP),
            None,
        );
        assert_eq!(result, VerificationResult::Failed, "nonce byte {}", i);
    }
}

#[test]
fn test_fails_closed_for_every_missing_combination() {
    let key = server_key();
    let verifier = response_verifier(&key);
    let nonce = create_random_nonce();
    let body = "{}";
    let etag = "etag-1";
    let signature = sign_payload(&key, [1u8; SALT_SIZE], &nonce, TIMESTAMP, body);

    for mask in 0u8..16 {
        let signature = (mask & 1 != 0).then_some(signature.as_str());
        let timestamp = (mask & 2 != 0).then_some(TIMESTAMP);
        let body = (mask & 4 != 0).then_some(body);
        let etag = (mask & 8 != 0).then_some(etag);

        let complete =
            signature.is_some() && timestamp.is_some() && (body.is_some() || etag.is_some());
        let result = verifier.verify_response(PATH, signature, &nonce, body, timestamp, etag);
        if !complete {
            assert_eq!(result, VerificationResult::Failed, "mask {:04b}", mask);
        }
    }
}

#[test]
fn test_body_takes_precedence_over_etag() {
    let key = server_key();
    let verifier = response_verifier(&key);
    let nonce = create_random_nonce();
    let etag_signature = sign_payload(&key, [2u8; SALT_SIZE], &nonce, TIMESTAMP, "etag-1");

    let result = verifier.verify_response(
        PATH,
        Some(etag_signature.as_str()),
        &nonce,
        Some("{}"),
        Some(TIMESTAMP),
        Some("etag-1"),
    );
    assert_eq!(result, VerificationResult::Failed);

    let result = verifier.verify_response(
        PATH,
        Some(etag_signature.as_str()),
        &nonce,
        None,
        Some(TIMESTAMP),
        Some("etag-1"),
    );
    assert_eq!(result, VerificationResult::Verified);
}

#[test]
fn test_public_key_from_base64() {
    let encoded = public_key_base64(&server_key());
    let verifier = Ed25519SignatureVerifier::from_base64(&encoded).unwrap();
    let verifier = ResponseVerifier::new(std::sync::Arc::new(verifier));
    let nonce = create_random_nonce();
    let signature = sign_payload(&server_key(), [3u8; SALT_SIZE], &nonce, TIMESTAMP, "{}");

    assert_eq!(
        verifier.verify_response(
            PATH,
            Some(signature.as_str()),
            &nonce,
            Some("{}"),
            Some(TIMESTAMP),
            None
        ),
        VerificationResult::Verified
    );
    assert!(Ed25519SignatureVerifier::from_base64("AAAA").is_err());
}
