//! Offline-first replication of one habit document between the on-device
//! cache and a remote document store.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
pub use config::*;

mod remote;
pub use remote::*;

mod protocol;
pub use protocol::*;

mod ws;
pub use ws::*;

mod reconcile;
pub use reconcile::*;

mod session;
pub use session::*;

mod scheduler;
pub use scheduler::*;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("subscription closed")]
    SubscriptionClosed,

    #[error("sync scheduler stopped")]
    Stopped,
}

impl SyncError {
    /// Transient failures are retried on the next tick or lifecycle trigger.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Network(_) | Self::Rejected(_) | Self::SubscriptionClosed
        )
    }
}

impl From<ledger::LedgerError> for SyncError {
    fn from(e: ledger::LedgerError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(format!("{e:#}"))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Account the document belongs to (the auth provider's user id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one running session (device, tab or process) in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable location of an account's document in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentPath(String);

impl DocumentPath {
    pub fn for_account(app_id: &str, account: &AccountId) -> Self {
        Self(format!("artifacts/{app_id}/users/{account}/habitData/data"))
    }

    pub fn from_raw(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
