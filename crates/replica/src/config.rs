use biocore::BioCoreConfig;
use ledger::EpochMillis;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// How much newer an empty remote must be before it counts as a reset
    /// rather than a stale or racing snapshot.
    pub reset_skew_tolerance_ms: EpochMillis,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reset_skew_tolerance_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Namespace for local keys and remote paths.
    pub app_id: String,
    pub reconcile: ReconcileConfig,
    pub biocore: BioCoreConfig,
    pub backup_staleness_ms: EpochMillis,
    pub tick_interval_ms: u64,
    /// Minimum spacing of opportunistic pushes from the tick.
    pub push_interval_ms: u64,
    /// How often to retry a lost subscription.
    pub resubscribe_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_id: "habit-sync".to_string(),
            reconcile: ReconcileConfig::default(),
            biocore: BioCoreConfig::default(),
            backup_staleness_ms: store::DEFAULT_BACKUP_STALENESS_MS,
            tick_interval_ms: 1_000,
            push_interval_ms: 12_000,
            resubscribe_interval_ms: 15_000,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Storage(format!("reading {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_millis(self.push_interval_ms)
    }

    pub fn resubscribe_interval(&self) -> Duration {
        Duration::from_millis(self.resubscribe_interval_ms)
    }
}
