use serde::{Deserialize, Serialize};

use crate::EpochMillis;

/// How an event was logged. An override is the "outside the plan" button and
/// costs roughly twice as much as a normal event.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    #[serde(alias = "regular")]
    Normal,
    #[serde(alias = "emergency")]
    Override,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Override => write!(f, "override"),
        }
    }
}

/// One entry of the history. The timestamp is the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireEvent")]
pub struct LoggedEvent {
    pub timestamp: EpochMillis,
    pub kind: EventKind,
}

impl LoggedEvent {
    pub const fn new(timestamp: EpochMillis, kind: EventKind) -> Self {
        Self { timestamp, kind }
    }

    pub const fn normal(timestamp: EpochMillis) -> Self {
        Self::new(timestamp, EventKind::Normal)
    }

    pub const fn override_at(timestamp: EpochMillis) -> Self {
        Self::new(timestamp, EventKind::Override)
    }
}

/// Accepted input shapes: the current `{timestamp, kind}` object, the older
/// `{timestamp, type}` object and the oldest bare timestamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireEvent {
    Bare(EpochMillis),
    Tagged {
        timestamp: EpochMillis,
        #[serde(default, alias = "type")]
        kind: EventKind,
    },
}

impl From<WireEvent> for LoggedEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Bare(timestamp) => Self::normal(timestamp),
            WireEvent::Tagged { timestamp, kind } => Self { timestamp, kind },
        }
    }
}
