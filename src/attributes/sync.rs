use std::sync::Arc;

use super::{to_user_attributes, AttributeKey, AttributeStore, SubscriberAttribute, UserAttributes};
use crate::backend::Backend;
use crate::error::Result;
use crate::identity::IdentityContext;

/// Outcome of one [`AttributeSyncer::sync_all_pending`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Users whose upload the server accepted
    pub synced_users: Vec<String>,
    /// Users whose upload the server rejected (4xx); their entries were
    /// marked synced anyway since a retry cannot succeed
    pub rejected_users: Vec<String>,
    /// Users whose upload failed in transit or with a 5xx; still pending
    pub failed_users: Vec<String>,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.synced_users.is_empty()
            && self.rejected_users.is_empty()
            && self.failed_users.is_empty()
    }
}

/// Records attributes for the current user and uploads pending ones.
pub struct AttributeSyncer {
    store: Arc<AttributeStore>,
    backend: Arc<dyn Backend>,
    identity: Arc<IdentityContext>,
}

impl AttributeSyncer {
    pub fn new(
        store: Arc<AttributeStore>,
        backend: Arc<dyn Backend>,
        identity: Arc<IdentityContext>,
    ) -> Self {
        Self {
            store,
            backend,
            identity,
        }
    }

    /// Set one attribute on the current user. `None` deletes it server-side.
    pub fn set_attribute(&self, key: impl Into<AttributeKey>, value: Option<String>) -> Result<()> {
        self.set_attributes([(key.into(), value)])
    }

    /// Set several attributes on the current user at once.
    ///
    /// Values equal to the stored ones are skipped.
    pub fn set_attributes<I>(&self, attributes: I) -> Result<()>
    where
        I: IntoIterator<Item = (AttributeKey, Option<String>)>,
    {
        let app_user_id = self.identity.current_app_user_id();
        let attributes = to_user_attributes(
            attributes
                .into_iter()
                .map(|(key, value)| SubscriberAttribute::new(key, value)),
        );
        let written = self.store.set_changed_attributes(&app_user_id, attributes)?;
        tracing::debug!(%app_user_id, written, "recorded subscriber attributes");
        Ok(())
    }

    /// Attributes of the current user not yet accepted by the server.
    pub fn pending_for_current_user(&self) -> Result<UserAttributes> {
        self.store
            .unsynced_attributes(&self.identity.current_app_user_id())
    }

    /// Upload pending attributes of every user, one user at a time.
    ///
    /// Backend errors are absorbed into the summary; only storage errors are
    /// returned.
    pub async fn sync_all_pending(&self) -> Result<SyncSummary> {
        let current = self.identity.current_app_user_id();
        let pending = self.store.all_unsynced_attributes()?;
        let mut summary = SyncSummary::default();

        for (app_user_id, attributes) in pending {
            tracing::debug!(%app_user_id, count = attributes.len(), "syncing attributes");

            match self.backend.post_attributes(&app_user_id, &attributes).await {
                Ok(()) => {
                    self.store.mark_as_synced(&app_user_id, &attributes)?;
                    summary.synced_users.push(app_user_id.clone());
                }
                Err(e) if e.is_client_error() => {
                    tracing::error!(%app_user_id, error = %e, "server rejected attributes");
                    self.store.mark_as_synced(&app_user_id, &attributes)?;
                    summary.rejected_users.push(app_user_id.clone());
                }
                Err(e) => {
                    tracing::warn!(%app_user_id, error = %e, "attribute sync failed, will retry");
                    summary.failed_users.push(app_user_id);
                    continue;
                }
            }

            if app_user_id != current {
                self.store.clear_attributes_if_all_synced(&app_user_id)?;
            }
        }

        if !summary.is_empty() {
            tracing::info!(
                synced = summary.synced_users.len(),
                rejected = summary.rejected_users.len(),
                failed = summary.failed_users.len(),
                "attribute sync finished"
            );
        }
        Ok(summary)
    }
}

impl std::fmt::Debug for AttributeSyncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSyncer").finish_non_exhaustive()
    }
}
