//! Who the current user is, and how that changes.

mod manager;

use std::sync::{PoisonError, RwLock};

pub use manager::IdentityManager;

use crate::id::is_anonymous_id;

/// Holder of the current app user id, shared by every component that acts
/// on behalf of "the current user".
///
/// Only [`IdentityManager`] changes it. The id is empty until the manager
/// has been configured.
#[derive(Debug, Default)]
pub struct IdentityContext {
    current: RwLock<String>,
}

impl IdentityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_app_user_id(&self) -> String {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_configured(&self) -> bool {
        !self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Whether the current id has the generated anonymous shape.
    pub fn is_anonymous(&self) -> bool {
        is_anonymous_id(&self.current_app_user_id())
    }

    pub(crate) fn set(&self, app_user_id: impl Into<String>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = app_user_id.into();
    }
}
