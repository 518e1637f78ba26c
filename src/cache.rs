//! Device-local caches the identity manager keeps coherent.
//!
//! Writes are staged into a [`StorageEdit`] so an identity transition can
//! clear one user's caches and install another's in a single commit.

use std::sync::Arc;

use crate::customer_info::CustomerInfo;
use crate::error::Result;
use crate::storage::{keys, KeyValueStore, StorageEdit};

/// Entitlement/offerings cache plus the persisted app user id.
pub trait EntitlementCache: Send + Sync {
    /// App user id persisted by the current layout
    fn cached_app_user_id(&self) -> Option<String>;

    /// App user id persisted by older SDK versions
    fn legacy_app_user_id(&self) -> Option<String>;

    /// Cached snapshot for a user, if any
    fn customer_info(&self, app_user_id: &str) -> Option<CustomerInfo>;

    fn stage_app_user_id(&self, edit: &mut StorageEdit, app_user_id: &str);

    fn stage_clear_legacy_app_user_id(&self, edit: &mut StorageEdit);

    fn stage_customer_info(
        &self,
        edit: &mut StorageEdit,
        app_user_id: &str,
        info: &CustomerInfo,
    ) -> Result<()>;

    fn stage_clear_customer_info(&self, edit: &mut StorageEdit, app_user_id: &str);

    fn stage_clear_offerings(&self, edit: &mut StorageEdit);

    /// Commit staged writes.
    fn apply(&self, edit: StorageEdit) -> Result<()>;

    fn cache_customer_info(&self, app_user_id: &str, info: &CustomerInfo) -> Result<()> {
        let mut edit = StorageEdit::new();
        self.stage_customer_info(&mut edit, app_user_id, info)?;
        self.apply(edit)
    }

    fn clear_customer_info(&self, app_user_id: &str) -> Result<()> {
        let mut edit = StorageEdit::new();
        self.stage_clear_customer_info(&mut edit, app_user_id);
        self.apply(edit)
    }

    fn clear_offerings(&self) -> Result<()> {
        let mut edit = StorageEdit::new();
        self.stage_clear_offerings(&mut edit);
        self.apply(edit)
    }
}

/// Network response cache (ETags) that must be dropped when cached data can
/// no longer be trusted.
pub trait ResponseCache: Send + Sync {
    fn clear(&self) -> Result<()>;
}

/// [`EntitlementCache`] over the persisted key/value store.
pub struct DeviceCache {
    storage: Arc<dyn KeyValueStore>,
    api_key: String,
}

impl DeviceCache {
    pub fn new(storage: Arc<dyn KeyValueStore>, api_key: impl Into<String>) -> Self {
        Self {
            storage,
            api_key: api_key.into(),
        }
    }

    /// Offerings payload, cached verbatim.
    pub fn offerings(&self) -> Option<String> {
        self.storage.get(&keys::offerings(&self.api_key))
    }

    pub fn cache_offerings(&self, raw: &str) -> Result<()> {
        self.storage.set(&keys::offerings(&self.api_key), raw)
    }
}

impl EntitlementCache for DeviceCache {
    fn cached_app_user_id(&self) -> Option<String> {
        self.storage.get(&keys::app_user_id(&self.api_key))
    }

    fn legacy_app_user_id(&self) -> Option<String> {
        self.storage.get(&keys::legacy_app_user_id(&self.api_key))
    }

    fn customer_info(&self, app_user_id: &str) -> Option<CustomerInfo> {
        let raw = self
            .storage
            .get(&keys::customer_info(&self.api_key, app_user_id))?;
        match CustomerInfo::from_cache_string(&raw) {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::warn!(app_user_id, error = %e, "ignoring unreadable cached customer info");
                None
            }
        }
    }

    fn stage_app_user_id(&self, edit: &mut StorageEdit, app_user_id: &str) {
        edit.set(keys::app_user_id(&self.api_key), app_user_id);
    }

    fn stage_clear_legacy_app_user_id(&self, edit: &mut StorageEdit) {
        edit.remove(keys::legacy_app_user_id(&self.api_key));
    }

    fn stage_customer_info(
        &self,
        edit: &mut StorageEdit,
        app_user_id: &str,
        info: &CustomerInfo,
    ) -> Result<()> {
        edit.set(
            keys::customer_info(&self.api_key, app_user_id),
            info.to_cache_string()?,
        );
        Ok(())
    }

    fn stage_clear_customer_info(&self, edit: &mut StorageEdit, app_user_id: &str) {
        edit.remove(keys::customer_info(&self.api_key, app_user_id));
    }

    fn stage_clear_offerings(&self, edit: &mut StorageEdit) {
        edit.remove(keys::offerings(&self.api_key));
    }

    fn apply(&self, edit: StorageEdit) -> Result<()> {
        self.storage.apply(edit)
    }
}

impl std::fmt::Debug for DeviceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCache").finish_non_exhaustive()
    }
}
