use anyhow::{Context, Result};
use ledger::{Document, EpochMillis};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{CacheKeys, KeyValueStore};

/// Durable on-device mirror of the full document.
#[derive(Clone)]
pub struct LocalCache {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl LocalCache {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: &CacheKeys) -> Self {
        Self {
            kv,
            key: keys.document.clone(),
        }
    }

    /// Reads the cached document. Anything unreadable counts as absent so the
    /// caller can fall back to defaults.
    pub fn load(&self) -> Option<Document> {
        let raw = match self.kv.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read local cache {}: {:#}", self.key, e);
                return None;
            }
        };
        match Document::from_json_str(&raw) {
            Ok(document) => Some(document),
            Err(e) => {
                warn!("Discarding unreadable local cache {}: {}", self.key, e);
                None
            }
        }
    }

    /// Persists `document`. With `bump_revision` the document revision is set
    /// to `now` first; passive writes leave it untouched so they are not taken
    /// for new user intent during a merge.
    pub fn save(&self, document: &mut Document, bump_revision: bool, now: EpochMillis) -> Result<()> {
        if bump_revision {
            document.document_revision_time = now;
        }
        let raw = document
            .to_json_string()
            .context("serializing document for local cache")?;
        self.kv
            .put(&self.key, &raw)
            .with_context(|| format!("writing local cache {}", self.key))?;
        debug!(
            "Cached document ({} events, revision {})",
            document.events.len(),
            document.document_revision_time
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        self.kv
            .delete(&self.key)
            .with_context(|| format!("clearing local cache {}", self.key))
    }
}
