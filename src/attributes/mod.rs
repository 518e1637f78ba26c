//! Per-user subscriber attributes.
//!
//! Attributes are small key/value facts about a user (email, attribution
//! ids, campaign parameters, custom keys) collected locally and uploaded
//! later. Each one carries a `synced` flag; unsynced attributes are never
//! discarded, whatever the caller asks for.

pub mod migrations;
mod store;
mod sync;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::AttributeStore;
pub use sync::{AttributeSyncer, SyncSummary};

/// Attributes of one user, keyed by backend key.
pub type UserAttributes = BTreeMap<String, SubscriberAttribute>;

/// Attributes of every user, keyed by app user id.
pub type AllAttributes = BTreeMap<String, UserAttributes>;

/// Keys the backend treats specially. Everything else is a custom key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservedAttribute {
    Email,
    PhoneNumber,
    DisplayName,
    PushToken,
    // Device identifiers
    Ip,
    GpsAdId,
    AndroidId,
    // Attribution ids
    AdjustId,
    AppsflyerId,
    FbAnonId,
    MparticleId,
    OnesignalId,
    AirshipChannelId,
    // Campaign parameters
    MediaSource,
    Campaign,
    AdGroup,
    Ad,
    Keyword,
    Creative,
}

const RESERVED_KEYS: &[(ReservedAttribute, &str)] = &[
    (ReservedAttribute::Email, "$email"),
    (ReservedAttribute::PhoneNumber, "$phoneNumber"),
    (ReservedAttribute::DisplayName, "$displayName"),
    (ReservedAttribute::PushToken, "$fcmTokens"),
    (ReservedAttribute::Ip, "$ip"),
    (ReservedAttribute::GpsAdId, "$gpsAdId"),
    (ReservedAttribute::AndroidId, "$androidId"),
    (ReservedAttribute::AdjustId, "$adjustId"),
    (ReservedAttribute::AppsflyerId, "$appsflyerId"),
    (ReservedAttribute::FbAnonId, "$fbAnonId"),
    (ReservedAttribute::MparticleId, "$mparticleId"),
    (ReservedAttribute::OnesignalId, "$onesignalId"),
    (ReservedAttribute::AirshipChannelId, "$airshipChannelId"),
    (ReservedAttribute::MediaSource, "$mediaSource"),
    (ReservedAttribute::Campaign, "$campaign"),
    (ReservedAttribute::AdGroup, "$adGroup"),
    (ReservedAttribute::Ad, "$ad"),
    (ReservedAttribute::Keyword, "$keyword"),
    (ReservedAttribute::Creative, "$creative"),
];

impl ReservedAttribute {
    pub fn backend_key(self) -> &'static str {
        RESERVED_KEYS
            .iter()
            .find(|(r, _)| *r == self)
            .map(|(_, k)| *k)
            .unwrap_or_default()
    }

    pub fn from_backend_key(key: &str) -> Option<Self> {
        RESERVED_KEYS
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(r, _)| *r)
    }
}

/// Attribute key as the backend sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttributeKey {
    Reserved(ReservedAttribute),
    Custom(String),
}

impl AttributeKey {
    pub fn custom(key: impl Into<String>) -> Self {
        let key = key.into();
        match ReservedAttribute::from_backend_key(&key) {
            Some(reserved) => Self::Reserved(reserved),
            None => Self::Custom(key),
        }
    }

    pub fn backend_key(&self) -> &str {
        match self {
            Self::Reserved(r) => r.backend_key(),
            Self::Custom(k) => k,
        }
    }
}

impl From<ReservedAttribute> for AttributeKey {
    fn from(r: ReservedAttribute) -> Self {
        Self::Reserved(r)
    }
}

impl From<String> for AttributeKey {
    fn from(key: String) -> Self {
        Self::custom(key)
    }
}

impl From<AttributeKey> for String {
    fn from(key: AttributeKey) -> Self {
        key.backend_key().to_string()
    }
}

impl std::fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.backend_key())
    }
}

/// One attribute of one user.
///
/// A `None` value asks the backend to delete the attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberAttribute {
    pub key: AttributeKey,
    pub value: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub set_time: DateTime<Utc>,
    pub is_synced: bool,
}

impl SubscriberAttribute {
    /// A new, not yet uploaded attribute set now.
    pub fn new(key: impl Into<AttributeKey>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
            set_time: Utc::now(),
            is_synced: false,
        }
    }

    pub fn synced(mut self) -> Self {
        self.is_synced = true;
        self
    }
}

/// Build a [`UserAttributes`] map from attributes, keyed by backend key.
pub fn to_user_attributes(
    attributes: impl IntoIterator<Item = SubscriberAttribute>,
) -> UserAttributes {
    attributes
        .into_iter()
        .map(|a| (a.key.backend_key().to_string(), a))
        .collect()
}
