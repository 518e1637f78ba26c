use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::ResponseCache;
use crate::error::Result;
use crate::storage::{keys, KeyValueStore, StorageEdit};
use crate::verification::{VerificationMode, VerificationResult};

/// Last successful response for a path, replayed on 304.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtagEntry {
    pub etag: String,
    pub body: String,
    pub verification: VerificationResult,
}

/// Persisted ETag cache, one entry per request path.
pub struct EtagCache {
    storage: Arc<dyn KeyValueStore>,
    api_key: String,
}

impl EtagCache {
    pub fn new(storage: Arc<dyn KeyValueStore>, api_key: impl Into<String>) -> Self {
        Self {
            storage,
            api_key: api_key.into(),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", keys::etag_prefix(&self.api_key), path)
    }

    pub fn get(&self, path: &str) -> Option<EtagEntry> {
        let raw = self.storage.get(&self.key(path))?;
        serde_json::from_str(&raw).ok()
    }

    /// The stored entry, if it may be offered to the server under `mode`.
    ///
    /// While verifying, only entries that were themselves verified qualify;
    /// otherwise a 304 would resurrect an unverified body.
    pub fn usable_entry(&self, path: &str, mode: &VerificationMode) -> Option<EtagEntry> {
        let entry = self.get(path)?;
        if mode.should_verify() && !entry.verification.is_verified() {
            tracing::debug!(path, "ignoring etag cached without verification");
            return None;
        }
        Some(entry)
    }

    pub fn store(&self, path: &str, entry: &EtagEntry) -> Result<()> {
        self.storage.set(&self.key(path), &serde_json::to_string(entry)?)
    }
}

impl ResponseCache for EtagCache {
    fn clear(&self) -> Result<()> {
        let mut edit = StorageEdit::new();
        for key in self
            .storage
            .keys_with_prefix(&keys::etag_prefix(&self.api_key))
        {
            edit.remove(key);
        }
        if edit.is_empty() {
            return Ok(());
        }
        tracing::debug!("clearing etag cache");
        self.storage.apply(edit)
    }
}

impl std::fmt::Debug for EtagCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtagCache").finish_non_exhaustive()
    }
}
