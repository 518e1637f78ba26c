use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::migrations;
use super::{AllAttributes, UserAttributes};
use crate::error::Result;
use crate::storage::{keys, KeyValueStore, StorageEdit};

/// On-disk document: every user's attributes under one key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct AttributesDocument {
    #[serde(default)]
    attributes: AllAttributes,
}

/// Persisted map of app user id -> attribute key -> attribute.
///
/// All reads and writes go through one mutex, and every write replaces the
/// whole document in a single storage edit, so readers never observe a
/// half-applied merge.
pub struct AttributeStore {
    storage: Arc<dyn KeyValueStore>,
    api_key: String,
    lock: Mutex<()>,
}

impl AttributeStore {
    pub fn new(storage: Arc<dyn KeyValueStore>, api_key: impl Into<String>) -> Self {
        Self {
            storage,
            api_key: api_key.into(),
            lock: Mutex::new(()),
        }
    }

    /// Attributes of every user.
    pub fn all_attributes(&self) -> Result<AllAttributes> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read()
    }

    /// Attributes of one user, synced or not.
    pub fn attributes_for(&self, app_user_id: &str) -> Result<UserAttributes> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.remove(app_user_id).unwrap_or_default())
    }

    /// Merge `new_attributes` into the user's map and persist.
    ///
    /// Same-key entries are overwritten; keys not in `new_attributes` are kept.
    pub fn set_attributes(&self, app_user_id: &str, new_attributes: UserAttributes) -> Result<()> {
        if new_attributes.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        all.entry(app_user_id.to_string())
            .or_default()
            .extend(new_attributes);
        self.write(&all, StorageEdit::new())
    }

    /// Like [`AttributeStore::set_attributes`], but skips entries whose value
    /// already matches the stored one, so re-setting a value does not create
    /// new pending work. Returns how many entries were written.
    pub fn set_changed_attributes(
        &self,
        app_user_id: &str,
        new_attributes: UserAttributes,
    ) -> Result<usize> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        let existing = all.entry(app_user_id.to_string()).or_default();
        let changed: UserAttributes = new_attributes
            .into_iter()
            .filter(|(key, attr)| existing.get(key).map_or(true, |old| old.value != attr.value))
            .collect();
        if changed.is_empty() {
            return Ok(0);
        }
        let count = changed.len();
        existing.extend(changed);
        self.write(&all, StorageEdit::new())?;
        Ok(count)
    }

    /// Unsynced attributes of one user.
    pub fn unsynced_attributes(&self, app_user_id: &str) -> Result<UserAttributes> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let all = self.read()?;
        Ok(all
            .get(app_user_id)
            .map(only_unsynced)
            .unwrap_or_default())
    }

    /// Unsynced attributes of every user. Users with nothing pending are omitted.
    pub fn all_unsynced_attributes(&self) -> Result<AllAttributes> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self
            .read()?
            .iter()
            .map(|(user, attrs)| (user.clone(), only_unsynced(attrs)))
            .filter(|(_, attrs)| !attrs.is_empty())
            .collect())
    }

    /// Flag the uploaded attributes as synced.
    ///
    /// An entry is only flagged if it still holds the uploaded value and set
    /// time; one that changed while the upload was in flight stays pending.
    pub fn mark_as_synced(&self, app_user_id: &str, uploaded: &UserAttributes) -> Result<()> {
        if uploaded.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        let Some(current) = all.get_mut(app_user_id) else {
            return Ok(());
        };

        let mut changed = false;
        for (key, sent) in uploaded {
            if let Some(stored) = current.get_mut(key)
                && !stored.is_synced
                && stored.value == sent.value
                && stored.set_time == sent.set_time
            {
                stored.is_synced = true;
                changed = true;
            }
        }

        if changed {
            self.write(&all, StorageEdit::new())?;
        }
        Ok(())
    }

    /// Delete every attribute of the user, but only if none are pending.
    ///
    /// Returns whether anything was removed.
    pub fn clear_attributes_if_all_synced(&self, app_user_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        let Some(attrs) = all.get(app_user_id) else {
            return Ok(false);
        };
        if attrs.values().any(|a| !a.is_synced) {
            tracing::debug!(app_user_id, "keeping attributes, some are not synced yet");
            return Ok(false);
        }
        all.remove(app_user_id);
        self.write(&all, StorageEdit::new())?;
        Ok(true)
    }

    /// Delete every attribute of the user unconditionally.
    ///
    /// Only for callers that already confirmed the server has everything.
    pub fn clear_all_attributes(&self, app_user_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        if all.remove(app_user_id).is_some() {
            self.write(&all, StorageEdit::new())?;
        }
        Ok(())
    }

    /// Drop synced attributes of every user except `current_app_user_id`.
    ///
    /// Unsynced attributes survive whoever owns them.
    pub fn prune_synced_for_other_users(&self, current_app_user_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        if prune_synced(&mut all, current_app_user_id) {
            self.write(&all, StorageEdit::new())?;
        }
        Ok(())
    }

    /// Copy `from`'s unsynced attributes onto `to`, overwriting same keys.
    ///
    /// `from` keeps its copies; they are cleaned up once synced.
    pub fn copy_unsynced_attributes(&self, from: &str, to: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        let pending = all.get(from).map(only_unsynced).unwrap_or_default();
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(from, to, count = pending.len(), "copying unsynced attributes");
        all.entry(to.to_string()).or_default().extend(pending);
        self.write(&all, StorageEdit::new())
    }

    /// Fold the legacy one-entry-per-user layout into the current document.
    ///
    /// Idempotent: does nothing once the schema version is current.
    pub fn migrate_legacy_format(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        let mut edit = StorageEdit::new();
        if migrations::run_pending(self.storage.as_ref(), &self.api_key, &mut all, &mut edit)? {
            self.write(&all, edit)?;
        }
        Ok(())
    }

    /// Startup cleanup: run pending migrations, prune other users' synced
    /// attributes, and commit the result together with `edit`.
    ///
    /// `edit` carries the caller's own writes (e.g. the resolved user id) so
    /// the whole configure step lands in one storage edit.
    pub fn commit_with_cleanup(
        &self,
        current_app_user_id: &str,
        mut edit: StorageEdit,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        migrations::run_pending(self.storage.as_ref(), &self.api_key, &mut all, &mut edit)?;
        prune_synced(&mut all, current_app_user_id);
        self.write(&all, edit)
    }

    /// Commit an identity change: optionally carry `from`'s unsynced
    /// attributes over to `to`, prune synced attributes of everyone but
    /// `to`, and apply all of it together with `edit`.
    ///
    /// Nothing is written if the edit fails, so a failed switch never leaves
    /// copies behind on `to`.
    pub fn commit_identity_change(
        &self,
        from: &str,
        to: &str,
        copy_unsynced: bool,
        edit: StorageEdit,
    ) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read()?;
        if copy_unsynced {
            let pending = all.get(from).map(only_unsynced).unwrap_or_default();
            if !pending.is_empty() {
                tracing::debug!(from, to, count = pending.len(), "copying unsynced attributes");
                all.entry(to.to_string()).or_default().extend(pending);
            }
        }
        prune_synced(&mut all, to);
        self.write(&all, edit)
    }

    fn read(&self) -> Result<AllAttributes> {
        match self.storage.get(&keys::attributes(&self.api_key)) {
            Some(raw) => Ok(serde_json::from_str::<AttributesDocument>(&raw)?.attributes),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Replace the whole document, plus any extra writes, in one edit.
    fn write(&self, all: &AllAttributes, mut edit: StorageEdit) -> Result<()> {
        let key = keys::attributes(&self.api_key);
        if all.is_empty() {
            edit.remove(key);
        } else {
            let doc = serde_json::json!({ "attributes": all });
            edit.set(key, doc.to_string());
        }
        self.storage.apply(edit).inspect_err(|e| {
            tracing::error!(error = %e, "failed to persist subscriber attributes");
        })
    }
}

fn only_unsynced(attrs: &UserAttributes) -> UserAttributes {
    attrs
        .iter()
        .filter(|(_, a)| !a.is_synced)
        .map(|(k, a)| (k.clone(), a.clone()))
        .collect()
}

/// Returns whether anything was dropped.
fn prune_synced(all: &mut AllAttributes, current_app_user_id: &str) -> bool {
    let mut changed = false;
    for (user, attrs) in all.iter_mut() {
        if user == current_app_user_id {
            continue;
        }
        let before = attrs.len();
        attrs.retain(|_, a| !a.is_synced);
        changed |= attrs.len() != before;
    }
    all.retain(|_, attrs| !attrs.is_empty());
    changed
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore").finish_non_exhaustive()
    }
}
