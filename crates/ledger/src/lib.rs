use thiserror::Error;

mod clock;
pub use clock::*;
mod event;
pub use event::*;
mod log;
pub use log::*;
mod document;
pub use document::*;
mod legacy;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Wall-clock instant in milliseconds since the Unix epoch.
pub type EpochMillis = i64;

pub const MILLIS_PER_MINUTE: EpochMillis = 60 * 1000;
pub const MILLIS_PER_HOUR: EpochMillis = 60 * MILLIS_PER_MINUTE;
pub const MILLIS_PER_DAY: EpochMillis = 24 * MILLIS_PER_HOUR;
