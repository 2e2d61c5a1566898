use anyhow::{Context, Result};
use ledger::{Document, EpochMillis, MILLIS_PER_DAY};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::{CacheKeys, KeyValueStore};

pub const DEFAULT_BACKUP_STALENESS_MS: EpochMillis = 7 * MILLIS_PER_DAY;

/// Secondary copy of the document, tagged with when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    #[serde(flatten)]
    pub document: Document,
    pub snapshot_time: EpochMillis,
}

/// Safety net against reconciliation shrinking the history.
#[derive(Clone)]
pub struct BackupGuard {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    staleness_ms: EpochMillis,
}

impl BackupGuard {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: &CacheKeys) -> Self {
        Self {
            kv,
            key: keys.backup.clone(),
            staleness_ms: DEFAULT_BACKUP_STALENESS_MS,
        }
    }

    pub fn with_staleness(mut self, staleness_ms: EpochMillis) -> Self {
        self.staleness_ms = staleness_ms;
        self
    }

    /// Stores a copy of `document` unless its log is empty. Returns whether a
    /// snapshot was written.
    pub fn snapshot(&self, document: &Document, now: EpochMillis) -> Result<bool> {
        if document.events.is_empty() {
            return Ok(false);
        }
        let snapshot = BackupSnapshot {
            document: document.clone(),
            snapshot_time: now,
        };
        let raw = serde_json::to_string(&snapshot).context("serializing backup snapshot")?;
        self.kv
            .put(&self.key, &raw)
            .with_context(|| format!("writing backup {}", self.key))?;
        Ok(true)
    }

    pub fn load(&self) -> Option<BackupSnapshot> {
        let raw = match self.kv.get(&self.key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!("Failed to read backup {}: {:#}", self.key, e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Ignoring unreadable backup {}: {}", self.key, e);
                None
            }
        }
    }

    /// True when `backup` holds strictly more events than `candidate` and is
    /// younger than the staleness window.
    pub fn should_restore(
        &self,
        candidate: &Document,
        backup: &BackupSnapshot,
        now: EpochMillis,
    ) -> bool {
        let age = now - backup.snapshot_time;
        backup.document.events.len() > candidate.events.len() && age <= self.staleness_ms
    }

    pub fn restore(&self, backup: BackupSnapshot) -> Document {
        backup.document
    }

    pub fn clear(&self) -> Result<()> {
        self.kv
            .delete(&self.key)
            .with_context(|| format!("clearing backup {}", self.key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;
    use ledger::{EventLog, LoggedEvent};

    fn guard() -> BackupGuard {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKv::new());
        BackupGuard::new(kv, &CacheKeys::for_account("test", "acct"))
    }

    fn doc_with(count: i64) -> Document {
        let mut doc = Document::new_default(0);
        doc.events = EventLog::from_events((1..=count).map(LoggedEvent::normal));
        doc
    }

    #[test]
    fn empty_documents_are_not_snapshotted() {
        let guard = guard();
        assert!(!guard.snapshot(&doc_with(0), 10).unwrap());
        assert!(guard.load().is_none());
    }

    #[test]
    fn snapshot_round_trips_without_metadata() {
        let guard = guard();
        let doc = doc_with(3);
        assert!(guard.snapshot(&doc, 10).unwrap());
        let backup = guard.load().unwrap();
        assert_eq!(backup.snapshot_time, 10);
        assert_eq!(guard.restore(backup), doc);
    }

    #[test]
    fn restore_only_when_larger_and_fresh() {
        let guard = guard().with_staleness(1_000);
        guard.snapshot(&doc_with(5), 100).unwrap();
        let backup = guard.load().unwrap();

        assert!(guard.should_restore(&doc_with(0), &backup, 200));
        assert!(guard.should_restore(&doc_with(4), &backup, 1_100));
        assert!(!guard.should_restore(&doc_with(5), &backup, 200));
        assert!(!guard.should_restore(&doc_with(9), &backup, 200));
        assert!(!guard.should_restore(&doc_with(0), &backup, 1_101));
    }

    #[test]
    fn clear_drops_snapshot() {
        let guard = guard();
        guard.snapshot(&doc_with(1), 1).unwrap();
        guard.clear().unwrap();
        assert!(guard.load().is_none());
    }
}
