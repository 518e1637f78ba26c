//! Test utilities and fixtures for purchases-core integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey};

pub use purchases_core::attributes::{
    to_user_attributes, AttributeKey, AttributeStore, ReservedAttribute, SubscriberAttribute,
    UserAttributes,
};
pub use purchases_core::backend::{Backend, LogInResponse};
pub use purchases_core::error::{PurchasesError, PurchasesErrorCode, Result};
pub use purchases_core::id::{generate_anonymous_id, is_anonymous_id};
pub use purchases_core::storage::{keys, KeyValueStore, MemoryStorage, StorageEdit, StorageOp};
pub use purchases_core::verification::{
    signed_message, Ed25519SignatureVerifier, ResponseVerifier, VerificationMode,
    VerificationResult, SALT_SIZE,
};
pub use purchases_core::{CustomerInfo, Purchases, PurchasesOptions};

pub const API_KEY: &str = "appl_test";
pub const TIMESTAMP: &str = "1700000000000";

/// Deterministic signing key standing in for the server's.
pub fn server_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

/// A key the client does not trust.
pub fn other_key() -> SigningKey {
    SigningKey::from_bytes(&[8u8; 32])
}

pub fn public_key_base64(key: &SigningKey) -> String {
    BASE64.encode(key.verifying_key().as_bytes())
}

pub fn response_verifier(key: &SigningKey) -> Arc<ResponseVerifier> {
    Arc::new(ResponseVerifier::new(Arc::new(
        Ed25519SignatureVerifier::from_verifying_key(key.verifying_key()),
    )))
}

pub fn enforced_mode() -> VerificationMode {
    VerificationMode::Enforced(response_verifier(&server_key()))
}

pub fn informational_mode() -> VerificationMode {
    VerificationMode::Informational(response_verifier(&server_key()))
}

/// Sign `payload` the way the server does: base64(salt || sig).
pub fn sign_payload(
    key: &SigningKey,
    salt: [u8; SALT_SIZE],
    nonce: &str,
    timestamp: &str,
    payload: &str,
) -> String {
    let nonce = BASE64.decode(nonce).expect("nonce is base64");
    let message = signed_message(&salt, &nonce, timestamp, payload);
    let mut out = salt.to_vec();
    out.extend_from_slice(&key.sign(&message).to_bytes());
    BASE64.encode(out)
}

/// Subscriber response body with the given entitlements
/// (identifier, RFC 3339 expiry or `None` for lifetime).
pub fn customer_info_body(app_user_id: &str, entitlements: &[(&str, Option<&str>)]) -> String {
    let entitlements: serde_json::Map<String, serde_json::Value> = entitlements
        .iter()
        .map(|(id, expires)| {
            (
                id.to_string(),
                serde_json::json!({
                    "product_identifier": format!("{}_product", id),
                    "expires_date": expires,
                    "purchase_date": "2024-01-01T00:00:00Z",
                }),
            )
        })
        .collect();

    serde_json::json!({
        "request_date": "2024-06-01T00:00:00Z",
        "subscriber": {
            "original_app_user_id": app_user_id,
            "entitlements": entitlements,
        }
    })
    .to_string()
}

pub fn customer_info_for(app_user_id: &str) -> CustomerInfo {
    CustomerInfo::from_response(
        &customer_info_body(app_user_id, &[("pro", None)]),
        VerificationResult::NotRequested,
    )
    .expect("fixture body parses")
}

pub fn attr(key: &str, value: &str) -> SubscriberAttribute {
    SubscriberAttribute::new(AttributeKey::custom(key), Some(value.to_string()))
}

/// Every key/value in storage, for before/after comparisons.
pub fn snapshot(storage: &MemoryStorage) -> BTreeMap<String, String> {
    storage
        .keys_with_prefix("")
        .into_iter()
        .filter_map(|k| storage.get(&k).map(|v| (k, v)))
        .collect()
}

/// [`MemoryStorage`] whose edits fail once they touch a chosen key.
#[derive(Default)]
pub struct FailingStorage {
    pub inner: MemoryStorage,
    fail_on: Mutex<Option<String>>,
}

impl FailingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every later edit that writes or removes `key`.
    pub fn fail_on_key(&self, key: impl Into<String>) {
        *self.fail_on.lock().unwrap() = Some(key.into());
    }
}

impl KeyValueStore for FailingStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner.keys_with_prefix(prefix)
    }

    fn apply(&self, edit: StorageEdit) -> Result<()> {
        if let Some(key) = self.fail_on.lock().unwrap().as_deref() {
            let touches = edit.ops().iter().any(|op| match op {
                StorageOp::Set(k, _) | StorageOp::Remove(k) => k == key,
            });
            if touches {
                return Err(PurchasesError::storage("disk full"));
            }
        }
        self.inner.apply(edit)
    }
}

/// Scripted in-process [`Backend`].
#[derive(Default)]
pub struct MockBackend {
    pub customer_info_calls: AtomicUsize,
    pub log_in_calls: Mutex<Vec<(String, String)>>,
    pub posted_attributes: Mutex<Vec<(String, UserAttributes)>>,
    pub customer_info_error: Mutex<Option<PurchasesError>>,
    pub log_in_error: Mutex<Option<PurchasesError>>,
    pub post_attributes_error: Mutex<Option<PurchasesError>>,
    pub created: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_customer_info(&self, error: PurchasesError) {
        *self.customer_info_error.lock().unwrap() = Some(error);
    }

    pub fn fail_log_in(&self, error: PurchasesError) {
        *self.log_in_error.lock().unwrap() = Some(error);
    }

    pub fn fail_post_attributes(&self, error: PurchasesError) {
        *self.post_attributes_error.lock().unwrap() = Some(error);
    }

    pub fn log_in_calls(&self) -> Vec<(String, String)> {
        self.log_in_calls.lock().unwrap().clone()
    }

    pub fn posted_users(&self) -> Vec<String> {
        self.posted_attributes
            .lock()
            .unwrap()
            .iter()
            .map(|(user, _)| user.clone())
            .collect()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_customer_info(&self, app_user_id: &str) -> Result<CustomerInfo> {
        self.customer_info_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.customer_info_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(customer_info_for(app_user_id))
    }

    async fn log_in(&self, old_app_user_id: &str, new_app_user_id: &str) -> Result<LogInResponse> {
        self.log_in_calls
            .lock()
            .unwrap()
            .push((old_app_user_id.to_string(), new_app_user_id.to_string()));
        if let Some(e) = self.log_in_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(LogInResponse {
            customer_info: customer_info_for(new_app_user_id),
            created: self.created.load(Ordering::SeqCst),
        })
    }

    async fn post_attributes(&self, app_user_id: &str, attributes: &UserAttributes) -> Result<()> {
        self.posted_attributes
            .lock()
            .unwrap()
            .push((app_user_id.to_string(), attributes.clone()));
        if let Some(e) = self.post_attributes_error.lock().unwrap().clone() {
            return Err(e);
        }
        Ok(())
    }
}

/// Client over `storage` and `backend`, configured as `app_user_id`.
pub async fn purchases_with(
    backend: Arc<MockBackend>,
    storage: Arc<MemoryStorage>,
    app_user_id: Option<&str>,
    verification: VerificationMode,
) -> Purchases {
    Purchases::new(
        API_KEY,
        PurchasesOptions {
            storage: Some(storage as Arc<dyn KeyValueStore>),
            backend: Some(backend as Arc<dyn Backend>),
            app_user_id: app_user_id.map(str::to_string),
            verification: Some(verification),
            ..Default::default()
        },
    )
    .await
    .expect("client configures")
}

/// Client as a fresh anonymous user, verification disabled.
pub async fn anonymous_purchases(
    backend: Arc<MockBackend>,
    storage: Arc<MemoryStorage>,
) -> Purchases {
    purchases_with(backend, storage, None, VerificationMode::Disabled).await
}
