use std::sync::Arc;

use tokio::sync::Mutex;

use super::IdentityContext;
use crate::attributes::{AttributeStore, AttributeSyncer};
use crate::backend::{Backend, LogInResponse};
use crate::cache::{EntitlementCache, ResponseCache};
use crate::error::{PurchasesError, Result};
use crate::id::{generate_anonymous_id, is_anonymous_id, normalize_app_user_id};
use crate::storage::StorageEdit;
use crate::verification::{VerificationMode, VerificationResult};

/// Owns every change of the current user.
///
/// Transitions (`configure`, `log_in`, `log_out`, `switch_user`) are
/// serialized by one async mutex, so at most one is in flight at a time.
pub struct IdentityManager {
    identity: Arc<IdentityContext>,
    cache: Arc<dyn EntitlementCache>,
    response_cache: Arc<dyn ResponseCache>,
    attributes: Arc<AttributeStore>,
    syncer: Arc<AttributeSyncer>,
    backend: Arc<dyn Backend>,
    verification: VerificationMode,
    transition: Mutex<()>,
}

impl IdentityManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityContext>,
        cache: Arc<dyn EntitlementCache>,
        response_cache: Arc<dyn ResponseCache>,
        attributes: Arc<AttributeStore>,
        syncer: Arc<AttributeSyncer>,
        backend: Arc<dyn Backend>,
        verification: VerificationMode,
    ) -> Self {
        Self {
            identity,
            cache,
            response_cache,
            attributes,
            syncer,
            backend,
            verification,
            transition: Mutex::new(()),
        }
    }

    pub fn identity(&self) -> &Arc<IdentityContext> {
        &self.identity
    }

    /// Resolve and persist the starting user.
    ///
    /// Precedence: non-blank `requested` id, persisted id, legacy persisted
    /// id, fresh anonymous id. The id and the attribute cleanup are committed
    /// in one storage edit; nothing changes if that commit fails.
    pub async fn configure(&self, requested: Option<&str>) -> Result<String> {
        let _transition = self.transition.lock().await;

        let resolved = requested
            .and_then(normalize_app_user_id)
            .map(str::to_string)
            .or_else(|| non_blank(self.cache.cached_app_user_id()))
            .or_else(|| non_blank(self.cache.legacy_app_user_id()))
            .unwrap_or_else(generate_anonymous_id);

        let mut edit = StorageEdit::new();
        self.cache.stage_app_user_id(&mut edit, &resolved);
        self.attributes.commit_with_cleanup(&resolved, edit)?;
        self.identity.set(resolved.clone());

        if self.cached_without_verification(&resolved) {
            tracing::info!(
                mode = self.verification.name(),
                "cached data predates verification, clearing etag cache"
            );
            self.response_cache.clear()?;
        }

        tracing::info!(app_user_id = %resolved, "configured identity");
        Ok(resolved)
    }

    /// Identify as `new_app_user_id` on the server.
    ///
    /// On any error, local state is left exactly as it was.
    pub async fn log_in(&self, new_app_user_id: &str) -> Result<LogInResponse> {
        let new_app_user_id =
            normalize_app_user_id(new_app_user_id).ok_or_else(PurchasesError::invalid_app_user_id)?;
        let _transition = self.transition.lock().await;
        let old_app_user_id = self.identity.current_app_user_id();

        if new_app_user_id == old_app_user_id {
            tracing::debug!(app_user_id = %old_app_user_id, "already logged in, refreshing");
            let customer_info = self.backend.get_customer_info(&old_app_user_id).await?;
            self.cache
                .cache_customer_info(&old_app_user_id, &customer_info)?;
            return Ok(LogInResponse {
                customer_info,
                created: false,
            });
        }

        self.syncer.sync_all_pending().await?;
        let response = self
            .backend
            .log_in(&old_app_user_id, new_app_user_id)
            .await?;

        let mut edit = StorageEdit::new();
        self.cache.stage_clear_customer_info(&mut edit, &old_app_user_id);
        self.cache.stage_clear_offerings(&mut edit);
        self.cache.stage_app_user_id(&mut edit, new_app_user_id);
        self.cache
            .stage_customer_info(&mut edit, new_app_user_id, &response.customer_info)?;
        self.attributes.commit_identity_change(
            &old_app_user_id,
            new_app_user_id,
            self.is_anonymous(&old_app_user_id),
            edit,
        )?;
        self.identity.set(new_app_user_id);

        tracing::info!(
            from = %old_app_user_id,
            to = new_app_user_id,
            created = response.created,
            "logged in"
        );
        Ok(response)
    }

    /// Adopt `new_app_user_id` without asking the server.
    pub async fn switch_user(&self, new_app_user_id: &str) -> Result<()> {
        let new_app_user_id =
            normalize_app_user_id(new_app_user_id).ok_or_else(PurchasesError::invalid_app_user_id)?;
        let _transition = self.transition.lock().await;
        let old_app_user_id = self.identity.current_app_user_id();

        let mut edit = StorageEdit::new();
        self.cache.stage_clear_customer_info(&mut edit, &old_app_user_id);
        self.cache.stage_clear_offerings(&mut edit);
        self.cache.stage_app_user_id(&mut edit, new_app_user_id);
        self.attributes
            .commit_identity_change(&old_app_user_id, new_app_user_id, false, edit)?;
        self.identity.set(new_app_user_id);

        tracing::info!(from = %old_app_user_id, to = new_app_user_id, "switched user");
        Ok(())
    }

    /// Drop the identified user and start over as a fresh anonymous one.
    ///
    /// Returns the new anonymous id.
    pub async fn log_out(&self) -> Result<String> {
        let _transition = self.transition.lock().await;
        let old_app_user_id = self.identity.current_app_user_id();
        if self.is_anonymous(&old_app_user_id) {
            return Err(PurchasesError::log_out_anonymous_user());
        }

        self.syncer.sync_all_pending().await?;

        let anonymous_id = generate_anonymous_id();
        let mut edit = StorageEdit::new();
        self.cache.stage_clear_customer_info(&mut edit, &old_app_user_id);
        self.cache.stage_clear_offerings(&mut edit);
        self.cache.stage_clear_legacy_app_user_id(&mut edit);
        self.cache.stage_app_user_id(&mut edit, &anonymous_id);
        self.attributes
            .commit_identity_change(&old_app_user_id, &anonymous_id, false, edit)?;
        self.identity.set(anonymous_id.clone());

        self.response_cache.clear()?;

        tracing::info!(from = %old_app_user_id, "logged out");
        Ok(anonymous_id)
    }

    /// Whether the current user is anonymous, in the generated form or as
    /// the id persisted by older SDK versions.
    pub fn current_user_is_anonymous(&self) -> bool {
        self.is_anonymous(&self.identity.current_app_user_id())
    }

    fn is_anonymous(&self, app_user_id: &str) -> bool {
        is_anonymous_id(app_user_id)
            || self.cache.legacy_app_user_id().as_deref() == Some(app_user_id)
    }

    fn cached_without_verification(&self, app_user_id: &str) -> bool {
        self.verification.should_verify()
            && self
                .cache
                .customer_info(app_user_id)
                .is_some_and(|info| info.verification == VerificationResult::NotRequested)
    }
}

fn non_blank(id: Option<String>) -> Option<String> {
    id.filter(|id| normalize_app_user_id(id).is_some())
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("app_user_id", &self.identity.current_app_user_id())
            .field("verification", &self.verification)
            .finish_non_exhaustive()
    }
}
