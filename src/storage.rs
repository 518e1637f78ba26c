//! Persisted key/value storage
//!
//! Everything the core persists goes through [`KeyValueStore`]: opaque string
//! blobs keyed by string. Writes are expressed as a [`StorageEdit`] so several
//! logical writes (current user id, attribute map, cache clears) commit
//! together or not at all.

use std::collections::HashMap;
#[cfg(feature = "file-storage")]
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::error::Result;

/// Storage keys
pub mod keys {
    const PREFIX: &str = "purchases";

    /// Key for a value namespaced by API key.
    pub fn namespaced(api_key: &str, name: &str) -> String {
        format!("{}.{}.{}", PREFIX, api_key, name)
    }

    /// Current app user id
    pub fn app_user_id(api_key: &str) -> String {
        namespaced(api_key, "appUserID")
    }

    /// App user id persisted by older SDK versions (not namespaced)
    pub fn legacy_app_user_id(api_key: &str) -> String {
        format!("{}.{}", PREFIX, api_key)
    }

    /// Attribute map for every user, stored as one document
    pub fn attributes(api_key: &str) -> String {
        namespaced(api_key, "subscriberAttributes")
    }

    /// Prefix of the legacy one-entry-per-user attribute layout
    pub fn legacy_attributes_prefix(api_key: &str) -> String {
        format!("{}.", namespaced(api_key, "subscriberAttributes"))
    }

    /// Version marker for the attribute layout
    pub fn attributes_schema_version(api_key: &str) -> String {
        namespaced(api_key, "subscriberAttributesSchemaVersion")
    }

    /// Cached customer info for a user
    pub fn customer_info(api_key: &str, app_user_id: &str) -> String {
        namespaced(api_key, &format!("customerInfo.{}", app_user_id))
    }

    /// Cached offerings (global, not per user)
    pub fn offerings(api_key: &str) -> String {
        namespaced(api_key, "offerings")
    }

    /// Prefix of all ETag cache entries
    pub fn etag_prefix(api_key: &str) -> String {
        namespaced(api_key, "etag.")
    }
}

/// One write inside a [`StorageEdit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    Set(String, String),
    Remove(String),
}

/// Ordered batch of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageEdit {
    ops: Vec<StorageOp>,
}

impl StorageEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(StorageOp::Set(key.into(), value.into()));
        self
    }

    pub fn remove(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(StorageOp::Remove(key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[StorageOp] {
        &self.ops
    }

    fn apply_to(&self, map: &mut HashMap<String, String>) {
        for op in &self.ops {
            match op {
                StorageOp::Set(k, v) => {
                    map.insert(k.clone(), v.clone());
                }
                StorageOp::Remove(k) => {
                    map.remove(k);
                }
            }
        }
    }
}

/// Storage trait for custom storage implementations
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &str) -> Option<String>;

    /// All keys starting with `prefix`, in no particular order
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    /// Commit every operation of `edit`, or none of them
    fn apply(&self, edit: StorageEdit) -> Result<()>;

    /// Set a value by key
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut edit = StorageEdit::new();
        edit.set(key, value);
        self.apply(edit)
    }

    /// Remove a value by key
    fn remove(&self, key: &str) -> Result<()> {
        let mut edit = StorageEdit::new();
        edit.remove(key);
        self.apply(edit)
    }
}

/// In-memory storage, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn apply(&self, edit: StorageEdit) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        edit.apply_to(&mut data);
        Ok(())
    }
}

/// File-based storage
///
/// Stores everything in `purchases.json` within the specified directory.
/// Each edit rewrites the whole document through a temporary file and a
/// rename, so a crash leaves either the old or the new document on disk.
#[cfg(feature = "file-storage")]
pub struct FileStorage {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

#[cfg(feature = "file-storage")]
impl FileStorage {
    /// Open (or create) the storage document in `storage_dir`.
    ///
    /// The directory must exist. A missing document starts empty; a document
    /// that exists but cannot be parsed is an error rather than silently
    /// discarded, because it may hold unsynced attributes.
    pub fn open(storage_dir: &Path) -> Result<Self> {
        if !storage_dir.is_dir() {
            return Err(crate::error::PurchasesError::storage(format!(
                "storage directory {} does not exist",
                storage_dir.display()
            )));
        }

        let path = storage_dir.join("purchases.json");

        let cache = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                crate::error::PurchasesError::storage(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                ))
            })?;
            serde_json::from_str(&contents)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &HashMap<String, String>) -> Result<()> {
        let contents = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| {
                crate::error::PurchasesError::storage(format!(
                    "failed to write {}: {}",
                    self.path.display(),
                    e
                ))
            })
    }
}

#[cfg(feature = "file-storage")]
impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn apply(&self, edit: StorageEdit) -> Result<()> {
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = cache.clone();
        edit.apply_to(&mut next);
        // Only publish the new state once it is on disk.
        self.save(&next)?;
        *cache = next;
        Ok(())
    }
}

#[cfg(feature = "file-storage")]
impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}
