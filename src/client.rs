use std::collections::BTreeMap;
use std::sync::Arc;

use crate::attributes::{
    AttributeKey, AttributeStore, AttributeSyncer, ReservedAttribute, SyncSummary, UserAttributes,
};
use crate::backend::{Backend, EtagCache, HttpBackend, LogInResponse};
use crate::cache::{DeviceCache, EntitlementCache};
use crate::config::{validate_base_url, DEFAULT_BASE_URL};
use crate::customer_info::CustomerInfo;
use crate::error::{PurchasesError, PurchasesErrorCode, Result};
use crate::identity::{IdentityContext, IdentityManager};
use crate::storage::{KeyValueStore, MemoryStorage};
use crate::verification::VerificationMode;

/// Configuration options for [`Purchases`]
#[derive(Clone, Default)]
pub struct PurchasesOptions {
    /// Server URL (default: "https://api.revenuecat.com")
    pub base_url: Option<String>,
    /// Persisted key/value store (default: MemoryStorage)
    pub storage: Option<Arc<dyn KeyValueStore>>,
    /// User to start as (default: the persisted user, else a new anonymous one)
    pub app_user_id: Option<String>,
    /// Response verification (default: disabled)
    pub verification: Option<VerificationMode>,
    /// Replace the HTTP backend, e.g. with a test double
    pub backend: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for PurchasesOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchasesOptions")
            .field("base_url", &self.base_url)
            .field("storage", &self.storage.as_ref().map(|_| "<storage>"))
            .field("app_user_id", &self.app_user_id)
            .field("verification", &self.verification)
            .field("backend", &self.backend.as_ref().map(|_| "<backend>"))
            .finish()
    }
}

/// Entry point: one configured user, its entitlements and its attributes.
pub struct Purchases {
    identity: Arc<IdentityContext>,
    manager: IdentityManager,
    syncer: Arc<AttributeSyncer>,
    attributes: Arc<AttributeStore>,
    cache: Arc<DeviceCache>,
    backend: Arc<dyn Backend>,
}

impl Purchases {
    /// Wire every component and configure the starting user.
    pub async fn new(api_key: &str, options: PurchasesOptions) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(PurchasesError::configuration("api_key is required"));
        }

        let base_url = validate_base_url(options.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;
        let storage: Arc<dyn KeyValueStore> = options
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let verification = options.verification.unwrap_or_default();

        let identity = Arc::new(IdentityContext::new());
        let cache = Arc::new(DeviceCache::new(Arc::clone(&storage), api_key));
        let etags = Arc::new(EtagCache::new(Arc::clone(&storage), api_key));
        let attributes = Arc::new(AttributeStore::new(Arc::clone(&storage), api_key));

        let backend: Arc<dyn Backend> = match options.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::new(
                &base_url,
                api_key,
                verification.clone(),
                Arc::clone(&etags),
            )?),
        };

        let syncer = Arc::new(AttributeSyncer::new(
            Arc::clone(&attributes),
            Arc::clone(&backend),
            Arc::clone(&identity),
        ));
        let manager = IdentityManager::new(
            Arc::clone(&identity),
            cache.clone(),
            etags,
            Arc::clone(&attributes),
            Arc::clone(&syncer),
            Arc::clone(&backend),
            verification,
        );
        manager.configure(options.app_user_id.as_deref()).await?;

        Ok(Self {
            identity,
            manager,
            syncer,
            attributes,
            cache,
            backend,
        })
    }

    pub fn app_user_id(&self) -> String {
        self.identity.current_app_user_id()
    }

    pub fn is_anonymous(&self) -> bool {
        self.manager.current_user_is_anonymous()
    }

    pub async fn log_in(&self, app_user_id: &str) -> Result<LogInResponse> {
        self.manager.log_in(app_user_id).await
    }

    /// Returns the new anonymous id.
    pub async fn log_out(&self) -> Result<String> {
        self.manager.log_out().await
    }

    pub async fn switch_user(&self, app_user_id: &str) -> Result<()> {
        self.manager.switch_user(app_user_id).await
    }

    /// Fetch the current user's entitlements and cache them.
    ///
    /// Falls back to the cached snapshot when the server cannot be reached.
    /// Rejected responses (4xx, failed enforced verification) never fall back.
    pub async fn customer_info(&self) -> Result<CustomerInfo> {
        let app_user_id = self.app_user_id();
        match self.backend.get_customer_info(&app_user_id).await {
            Ok(info) => {
                self.cache.cache_customer_info(&app_user_id, &info)?;
                Ok(info)
            }
            Err(e) if e.code == PurchasesErrorCode::Network => {
                match self.cache.customer_info(&app_user_id) {
                    Some(cached) => {
                        tracing::warn!(
                            %app_user_id,
                            error = %e,
                            "offline, using cached customer info"
                        );
                        Ok(cached)
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    pub fn cached_customer_info(&self) -> Option<CustomerInfo> {
        self.cache.customer_info(&self.app_user_id())
    }

    pub fn set_attribute(&self, key: impl Into<AttributeKey>, value: Option<String>) -> Result<()> {
        self.syncer.set_attribute(key, value)
    }

    /// Set several attributes. A `None` value deletes the attribute.
    pub fn set_attributes(&self, attributes: BTreeMap<String, Option<String>>) -> Result<()> {
        self.syncer.set_attributes(
            attributes
                .into_iter()
                .map(|(key, value)| (AttributeKey::custom(key), value)),
        )
    }

    pub fn set_email(&self, email: Option<String>) -> Result<()> {
        self.set_attribute(ReservedAttribute::Email, email)
    }

    pub fn set_phone_number(&self, phone_number: Option<String>) -> Result<()> {
        self.set_attribute(ReservedAttribute::PhoneNumber, phone_number)
    }

    pub fn set_display_name(&self, display_name: Option<String>) -> Result<()> {
        self.set_attribute(ReservedAttribute::DisplayName, display_name)
    }

    pub fn set_push_token(&self, token: Option<String>) -> Result<()> {
        self.set_attribute(ReservedAttribute::PushToken, token)
    }

    /// Every attribute of the current user, synced or not.
    pub fn attributes(&self) -> Result<UserAttributes> {
        self.attributes.attributes_for(&self.app_user_id())
    }

    pub async fn sync_attributes(&self) -> Result<SyncSummary> {
        self.syncer.sync_all_pending().await
    }
}

impl std::fmt::Debug for Purchases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Purchases")
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}
