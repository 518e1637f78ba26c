//! Network collaborator: the three calls the core makes to the server.

mod etag;
mod http;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::attributes::UserAttributes;
use crate::customer_info::CustomerInfo;
use crate::error::Result;

pub use etag::{EtagCache, EtagEntry};
pub use http::{
    HttpBackend, HttpResult, ETAG_HEADER, NONCE_HEADER, REQUEST_TIME_HEADER, SIGNATURE_HEADER,
};

/// Result of the identity-exchange call.
#[derive(Debug, Clone)]
pub struct LogInResponse {
    pub customer_info: CustomerInfo,
    /// Whether the server created a new user for `new_app_user_id`
    pub created: bool,
}

/// Calls the core makes to the remote entitlement server.
///
/// Errors are passed through to callers unchanged.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_customer_info(&self, app_user_id: &str) -> Result<CustomerInfo>;

    /// Exchange `old_app_user_id` for `new_app_user_id` on the server.
    async fn log_in(&self, old_app_user_id: &str, new_app_user_id: &str) -> Result<LogInResponse>;

    /// Upload a user's pending attributes.
    async fn post_attributes(&self, app_user_id: &str, attributes: &UserAttributes) -> Result<()>;
}

/// Wire body for an attribute upload:
/// `{"attributes": {key: {"value": v|null, "updated_at_ms": ms}}}`.
pub fn attributes_payload(attributes: &UserAttributes) -> Value {
    let inner: Map<String, Value> = attributes
        .iter()
        .map(|(key, attr)| {
            (
                key.clone(),
                json!({
                    "value": attr.value,
                    "updated_at_ms": attr.set_time.timestamp_millis(),
                }),
            )
        })
        .collect();
    json!({ "attributes": inner })
}
