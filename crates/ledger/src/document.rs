use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    legacy, start_of_local_day, Clock, EpochMillis, EventLog, LedgerError, Result, SystemClock,
};

/// User-editable tuning. Replicas never merge it field by field: the copy with
/// the newer `settings_revision_time` wins wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Price of one pack.
    pub unit_price: f64,
    pub units_per_pack: i64,
    /// Daily count before tracking started; the baseline for savings.
    pub baseline_daily_count: i64,
    pub min_interval_minutes: i64,
    pub target_daily_count: i64,
    pub settings_revision_time: EpochMillis,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            unit_price: 100.0,
            units_per_pack: 20,
            baseline_daily_count: 20,
            min_interval_minutes: 60,
            target_daily_count: 10,
            settings_revision_time: 0,
        }
    }
}

impl Settings {
    pub fn price_per_unit(&self) -> f64 {
        if self.units_per_pack > 0 {
            self.unit_price / self.units_per_pack as f64
        } else {
            0.0
        }
    }

    /// Clamps raw user input into usable values.
    pub fn sanitized(mut self) -> Self {
        if !self.unit_price.is_finite() || self.unit_price < 0.0 {
            self.unit_price = 0.0;
        }
        if self.units_per_pack <= 0 {
            self.units_per_pack = 1;
        }
        self.baseline_daily_count = self.baseline_daily_count.max(0);
        self.target_daily_count = self.target_daily_count.max(0);
        if self.min_interval_minutes <= 0 {
            self.min_interval_minutes = 60;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileState {
    pub profile_start_time: EpochMillis,
    /// Never decreases; replicas merge it with `max`.
    #[serde(default)]
    pub longest_abstention_hours: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl ProfileState {
    pub fn new(profile_start_time: EpochMillis) -> Self {
        Self {
            profile_start_time,
            longest_abstention_hours: 0,
            owner_id: None,
        }
    }

    /// Raises the record if `hours` beats it. Returns whether it changed.
    pub fn record_abstention(&mut self, hours: u64) -> bool {
        if hours > self.longest_abstention_hours {
            self.longest_abstention_hours = hours;
            true
        } else {
            false
        }
    }
}

/// The single synchronized unit of state for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub settings: Settings,
    pub profile: ProfileState,
    #[serde(default)]
    pub events: EventLog,
    /// Bumped on user intent (log, undo, settings save, reset), never on
    /// passive recompute. Zero means the document was never mutated.
    #[serde(default)]
    pub document_revision_time: EpochMillis,
}

impl Document {
    /// First-run document: empty history, profile starting at local midnight.
    pub fn new_default(now: EpochMillis) -> Self {
        Self {
            settings: Settings::default(),
            profile: ProfileState::new(start_of_local_day(now)),
            events: EventLog::new(),
            document_revision_time: 0,
        }
    }

    /// Document that replaces everything on an explicit reset. Both revision
    /// stamps are set to `now` so the wipe beats older replicas in a merge.
    pub fn reset_at(now: EpochMillis, owner_id: Option<String>) -> Self {
        let mut document = Self::new_default(now);
        document.profile.owner_id = owner_id;
        document.settings.settings_revision_time = now;
        document.document_revision_time = now;
        document
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.profile.owner_id = Some(owner_id.into());
        self
    }

    /// Derived from the log on every call; never cached.
    pub fn last_event_time(&self) -> Option<EpochMillis> {
        self.events.last().map(|e| e.timestamp)
    }

    pub fn to_json_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses either the current wire shape or the flat legacy shape. An
    /// undated legacy document starts at the beginning of today.
    pub fn from_json_value(value: Value) -> Result<Self> {
        let today = start_of_local_day(SystemClock.now_millis());
        Self::from_json_value_with_start(value, today)
    }

    /// Like [`Document::from_json_value`], with an explicit profile start for
    /// legacy documents that carry no date.
    pub fn from_json_value_with_start(value: Value, fallback_start: EpochMillis) -> Result<Self> {
        if !value.is_object() {
            return Err(LedgerError::InvalidDocument(
                "document must be a JSON object".to_string(),
            ));
        }
        if legacy::looks_legacy(&value) {
            return legacy::from_legacy_value(value, fallback_start);
        }
        serde_json::from_value(value).map_err(|e| LedgerError::InvalidDocument(e.to_string()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| LedgerError::InvalidDocument(e.to_string()))?;
        Self::from_json_value(value)
    }

    pub fn from_json_str_with_start(raw: &str, fallback_start: EpochMillis) -> Result<Self> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| LedgerError::InvalidDocument(e.to_string()))?;
        Self::from_json_value_with_start(value, fallback_start)
    }
}
