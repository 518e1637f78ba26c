//! Entitlement snapshot returned by the server.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::verification::VerificationResult;

/// One entitlement as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EntitlementInfo {
    #[serde(default)]
    pub product_identifier: Option<String>,
    /// `None` for lifetime entitlements
    #[serde(default)]
    pub expires_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub purchase_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SubscriberResponse {
    #[serde(default)]
    request_date: Option<DateTime<Utc>>,
    subscriber: Subscriber,
}

#[derive(Debug, Deserialize)]
struct Subscriber {
    original_app_user_id: String,
    #[serde(default)]
    entitlements: BTreeMap<String, EntitlementInfo>,
}

/// Stored form: the raw payload plus how it was verified.
///
/// The parsed fields are always re-derived from `raw`, so a cached snapshot
/// can never claim a verification result it was not stored with.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCustomerInfo {
    raw: serde_json::Value,
    verification: VerificationResult,
}

/// A user's entitlements at `request_date`, plus the verification result of
/// the response they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerInfo {
    pub original_app_user_id: String,
    pub request_date: Option<DateTime<Utc>>,
    pub entitlements: BTreeMap<String, EntitlementInfo>,
    pub verification: VerificationResult,
    raw: serde_json::Value,
}

impl CustomerInfo {
    /// Parse a subscriber response body.
    pub fn from_response(body: &str, verification: VerificationResult) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_str(body)?;
        Self::from_value(raw, verification)
    }

    fn from_value(raw: serde_json::Value, verification: VerificationResult) -> Result<Self> {
        let parsed: SubscriberResponse = serde_json::from_value(raw.clone())?;
        Ok(Self {
            original_app_user_id: parsed.subscriber.original_app_user_id,
            request_date: parsed.request_date,
            entitlements: parsed.subscriber.entitlements,
            verification,
            raw,
        })
    }

    /// Serialize for the cache.
    pub fn to_cache_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&StoredCustomerInfo {
            raw: self.raw.clone(),
            verification: self.verification,
        })?)
    }

    /// Rebuild from [`CustomerInfo::to_cache_string`] output.
    pub fn from_cache_string(cached: &str) -> Result<Self> {
        let stored: StoredCustomerInfo = serde_json::from_str(cached)?;
        Self::from_value(stored.raw, stored.verification)
    }

    /// Identifiers of entitlements active at `at`, sorted.
    pub fn active_entitlements_at(&self, at: DateTime<Utc>) -> Vec<&str> {
        self.entitlements
            .iter()
            .filter(|(_, e)| e.expires_date.map_or(true, |exp| exp > at))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn active_entitlements(&self) -> Vec<&str> {
        self.active_entitlements_at(Utc::now())
    }

    pub fn is_entitled(&self, entitlement: &str) -> bool {
        self.active_entitlements().contains(&entitlement)
    }

    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BODY: &str = r#"{
        "request_date": "2024-01-01T00:00:00Z",
        "subscriber": {
            "original_app_user_id": "alice",
            "entitlements": {
                "pro": {"product_identifier": "monthly", "expires_date": "2024-02-01T00:00:00Z"},
                "old": {"product_identifier": "monthly", "expires_date": "2023-02-01T00:00:00Z"},
                "lifetime": {"product_identifier": "forever", "expires_date": null}
            }
        }
    }"#;

    #[test]
    fn test_active_entitlements() {
        let info = CustomerInfo::from_response(BODY, VerificationResult::Verified).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert_eq!(info.active_entitlements_at(at), vec!["lifetime", "pro"]);
        assert_eq!(info.original_app_user_id, "alice");
    }

    #[test]
    fn test_cache_roundtrip_keeps_verification() {
        let info = CustomerInfo::from_response(BODY, VerificationResult::Failed).unwrap();
        let restored = CustomerInfo::from_cache_string(&info.to_cache_string().unwrap()).unwrap();
        assert_eq!(restored, info);
        assert_eq!(restored.verification, VerificationResult::Failed);
    }

    #[test]
    fn test_rejects_missing_subscriber() {
        assert!(CustomerInfo::from_response("{}", VerificationResult::NotRequested).is_err());
    }
}
