//! On-device persistence: a namespaced key-value store holding the cached
//! document and an independent backup snapshot.
mod kv;
pub use kv::*;
mod cache;
pub use cache::*;
mod backup;
pub use backup::*;

use std::path::PathBuf;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("habit_sync")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("local_cache.sqlite")
}

/// Storage keys for one account inside a shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    pub document: String,
    pub backup: String,
}

impl CacheKeys {
    pub fn for_account(namespace: &str, account: &str) -> Self {
        Self {
            document: format!("{namespace}/{account}/document"),
            backup: format!("{namespace}/{account}/backup"),
        }
    }
}
