//! Versioned migrations of the attribute storage layout.
//!
//! Older SDK versions stored one entry per user
//! (`purchases.<api_key>.subscriberAttributes.<app_user_id>`), each holding
//! that user's attribute map. The current layout is a single document with
//! an inner map per user. Migrations run once, at configure time, and record
//! the reached version next to the document.

use super::{AllAttributes, UserAttributes};
use crate::error::Result;
use crate::storage::{keys, KeyValueStore, StorageEdit};

/// Layout version written after all migrations have run.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Everything a migration may read or stage writes into.
pub struct MigrationContext<'a> {
    pub storage: &'a dyn KeyValueStore,
    pub api_key: &'a str,
    pub attributes: &'a mut AllAttributes,
    pub edit: &'a mut StorageEdit,
    /// Set by a migration that had to leave data behind. The version is not
    /// advanced past it, so it runs again on the next start.
    pub incomplete: bool,
}

/// A layout migration.
pub struct Migration {
    /// Version reached after this migration runs.
    pub version: u32,
    pub description: &'static str,
    pub up: fn(&mut MigrationContext<'_>) -> Result<()>,
}

/// All migrations in order. Add new migrations to the end of this list.
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 2,
    description: "fold per-user attribute entries into one document",
    up: migration_002_fold_legacy_entries,
}];

/// Schema version recorded in storage. Missing means the legacy layout.
pub fn schema_version(storage: &dyn KeyValueStore, api_key: &str) -> u32 {
    storage
        .get(&keys::attributes_schema_version(api_key))
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

/// Run every migration newer than the stored version.
///
/// Changes are applied to `attributes` in memory and any removals or the
/// version bump are staged into `edit`; the caller persists both together.
/// The recorded version only advances past migrations that completed.
/// Returns whether anything ran.
pub fn run_pending(
    storage: &dyn KeyValueStore,
    api_key: &str,
    attributes: &mut AllAttributes,
    edit: &mut StorageEdit,
) -> Result<bool> {
    let current = schema_version(storage, api_key);
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        return Ok(false);
    }

    let mut ctx = MigrationContext {
        storage,
        api_key,
        attributes,
        edit,
        incomplete: false,
    };
    let mut reached = current;
    for migration in pending {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "running attribute storage migration"
        );
        (migration.up)(&mut ctx)?;
        if ctx.incomplete {
            tracing::warn!(
                version = migration.version,
                "attribute storage migration incomplete, will retry on next start"
            );
            break;
        }
        reached = migration.version;
    }

    if reached > current {
        ctx.edit.set(
            keys::attributes_schema_version(api_key),
            reached.to_string(),
        );
    }
    Ok(true)
}

/// Current values win on collision; legacy entries only fill gaps.
fn migration_002_fold_legacy_entries(ctx: &mut MigrationContext<'_>) -> Result<()> {
    let prefix = keys::legacy_attributes_prefix(ctx.api_key);
    for key in ctx.storage.keys_with_prefix(&prefix) {
        let app_user_id = &key[prefix.len()..];
        if app_user_id.is_empty() {
            continue;
        }

        if let Some(raw) = ctx.storage.get(&key) {
            match serde_json::from_str::<UserAttributes>(&raw) {
                Ok(legacy) => {
                    let current = ctx.attributes.entry(app_user_id.to_string()).or_default();
                    for (attr_key, attr) in legacy {
                        current.entry(attr_key).or_insert(attr);
                    }
                }
                Err(e) => {
                    // Leave the entry on disk rather than lose pending data.
                    tracing::error!(app_user_id, error = %e, "unreadable legacy attribute entry");
                    ctx.incomplete = true;
                    continue;
                }
            }
        }
        ctx.edit.remove(key.clone());
    }
    Ok(())
}
