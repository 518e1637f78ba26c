use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{attributes_payload, Backend, EtagCache, EtagEntry, LogInResponse};
use crate::attributes::UserAttributes;
use crate::coalesce::Deduplicator;
use crate::customer_info::CustomerInfo;
use crate::error::{PurchasesError, Result};
use crate::verification::{create_random_nonce, VerificationMode, VerificationResult};

pub const NONCE_HEADER: &str = "X-Nonce";
pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const REQUEST_TIME_HEADER: &str = "X-RevenueCat-Request-Time";
pub const ETAG_HEADER: &str = "X-RevenueCat-ETag";

/// A successful response after ETag replay and verification.
#[derive(Debug, Clone)]
pub struct HttpResult {
    pub status: u16,
    pub body: String,
    pub verification: VerificationResult,
}

/// [`Backend`] over HTTPS.
pub struct HttpBackend {
    http: HttpClient,
    base_url: String,
    api_key: String,
    verification: VerificationMode,
    etags: Arc<EtagCache>,
    customer_info_requests: Deduplicator<String, CustomerInfo, PurchasesError>,
}

impl HttpBackend {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        verification: VerificationMode,
        etags: Arc<EtagCache>,
    ) -> Result<Self> {
        let http = HttpClient::builder()
            .user_agent(concat!("purchases-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PurchasesError::network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            verification,
            etags,
            customer_info_requests: Deduplicator::new(),
        })
    }

    pub fn verification_mode(&self) -> &VerificationMode {
        &self.verification
    }

    /// Send one request and apply the ETag and verification rules.
    ///
    /// `signed` marks endpoints whose responses carry entitlement data; only
    /// those get a nonce and a verification result.
    pub async fn perform(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        signed: bool,
    ) -> Result<HttpResult> {
        let nonce = (signed && self.verification.should_verify()).then(create_random_nonce);
        let cached = if method == Method::GET {
            self.etags.usable_entry(path, &self.verification)
        } else {
            None
        };

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.api_key);
        if let Some(nonce) = &nonce {
            request = request.header(NONCE_HEADER, nonce);
        }
        if let Some(entry) = &cached {
            request = request.header(ETAG_HEADER, &entry.etag);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!(%method, path, "sending request");
        let response = request
            .send()
            .await
            .map_err(|e| PurchasesError::network(e.to_string()))?;

        let status = response.status().as_u16();
        let (signature, request_time, etag) = {
            let headers = response.headers();
            let header = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            (
                header(SIGNATURE_HEADER),
                header(REQUEST_TIME_HEADER),
                header(ETAG_HEADER),
            )
        };

        let text = response
            .text()
            .await
            .map_err(|e| PurchasesError::network(e.to_string()))?;

        if status == 304 {
            let Some(entry) = cached else {
                return Err(PurchasesError::backend(
                    status,
                    format!("not modified without a cached response for {}", path),
                ));
            };
            let etag = etag.unwrap_or_else(|| entry.etag.clone());
            let verification = self.verify(
                path,
                nonce.as_deref(),
                signature.as_deref(),
                None,
                request_time.as_deref(),
                Some(etag.as_str()),
            )?;
            tracing::debug!(path, "replaying cached response");
            return Ok(HttpResult {
                status: 200,
                body: entry.body,
                verification,
            });
        }

        if !(200..300).contains(&status) {
            return Err(error_from_body(status, &text));
        }

        let verification = self.verify(
            path,
            nonce.as_deref(),
            signature.as_deref(),
            Some(text.as_str()),
            request_time.as_deref(),
            etag.as_deref(),
        )?;

        if let (Some(etag), true) = (etag, method == Method::GET) {
            let entry = EtagEntry {
                etag,
                body: text.clone(),
                verification,
            };
            if let Err(e) = self.etags.store(path, &entry) {
                tracing::warn!(path, error = %e, "failed to store etag");
            }
        }

        Ok(HttpResult {
            status,
            body: text,
            verification,
        })
    }

    fn verify(
        &self,
        path: &str,
        nonce: Option<&str>,
        signature: Option<&str>,
        body: Option<&str>,
        request_time: Option<&str>,
        etag: Option<&str>,
    ) -> Result<VerificationResult> {
        let (Some(verifier), Some(nonce)) = (self.verification.verifier(), nonce) else {
            return Ok(VerificationResult::NotRequested);
        };

        let result = verifier.verify_response(path, signature, nonce, body, request_time, etag);
        if result == VerificationResult::Failed {
            if self.verification.is_enforced() {
                tracing::error!(path, "rejecting response that failed verification");
                return Err(PurchasesError::signature_verification_failed(path));
            }
            tracing::warn!(path, "using response that failed verification");
        }
        Ok(result)
    }

    async fn fetch_customer_info(&self, path: &str) -> Result<CustomerInfo> {
        let result = self.perform(Method::GET, path, None, true).await?;
        CustomerInfo::from_response(&result.body, result.verification)
    }
}

fn subscriber_path(app_user_id: &str) -> String {
    format!("/v1/subscribers/{}", urlencoding::encode(app_user_id))
}

fn error_from_body(status: u16, body: &str) -> PurchasesError {
    #[derive(Deserialize)]
    struct ErrorResponse {
        code: Option<i64>,
        message: Option<String>,
    }

    let message = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(ErrorResponse {
            code: Some(code),
            message: Some(message),
        }) => format!("{} (code {})", message, code),
        Ok(ErrorResponse {
            message: Some(message),
            ..
        }) => message,
        _ => format!("request failed: {}", status),
    };
    PurchasesError::backend(status, message)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn get_customer_info(&self, app_user_id: &str) -> Result<CustomerInfo> {
        let path = subscriber_path(app_user_id);
        self.customer_info_requests
            .run(path.clone(), || self.fetch_customer_info(&path))
            .await
    }

    async fn log_in(&self, old_app_user_id: &str, new_app_user_id: &str) -> Result<LogInResponse> {
        let body = json!({
            "app_user_id": old_app_user_id,
            "new_app_user_id": new_app_user_id,
        });
        let result = self
            .perform(Method::POST, "/v1/subscribers/identify", Some(&body), true)
            .await?;

        Ok(LogInResponse {
            customer_info: CustomerInfo::from_response(&result.body, result.verification)?,
            created: result.status == 201,
        })
    }

    async fn post_attributes(&self, app_user_id: &str, attributes: &UserAttributes) -> Result<()> {
        let path = format!("{}/attributes", subscriber_path(app_user_id));
        self.perform(
            Method::POST,
            &path,
            Some(&attributes_payload(attributes)),
            false,
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("verification", &self.verification)
            .finish_non_exhaustive()
    }
}
