//! Import of the flat document shape written by the first generation of the
//! app (`smokeHistory`, `appStartDate`, pack-based settings).
use serde::Deserialize;
use serde_json::Value;

use crate::{
    Document, EpochMillis, EventLog, LedgerError, LoggedEvent, ProfileState, Result, Settings,
};

const LEGACY_MARKERS: [&str; 4] = [
    "smokeHistory",
    "appStartDate",
    "lastSmokeTime",
    "longestSmokeFreeStreakHours",
];

pub(crate) fn looks_legacy(value: &Value) -> bool {
    value.get("profile").is_none() && LEGACY_MARKERS.iter().any(|key| value.get(key).is_some())
}

/// `fallback_start` applies when the document has neither `appStartDate` nor
/// any event to date it by.
pub(crate) fn from_legacy_value(value: Value, fallback_start: EpochMillis) -> Result<Document> {
    let legacy: LegacyDocument =
        serde_json::from_value(value).map_err(|e| LedgerError::InvalidDocument(e.to_string()))?;
    Ok(legacy.into_document(fallback_start))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    #[serde(default)]
    smoke_history: Vec<LoggedEvent>,
    #[serde(default)]
    settings: LegacySettings,
    app_start_date: Option<EpochMillis>,
    #[serde(default)]
    longest_smoke_free_streak_hours: f64,
    current_user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacySettings {
    pack_price: Option<f64>,
    pack_size: Option<i64>,
    old_habit: Option<i64>,
    smoke_interval_minutes: Option<i64>,
    smoke_interval_hours: Option<f64>,
    desired_daily_sticks: Option<i64>,
}

impl LegacySettings {
    fn into_settings(self) -> Settings {
        let defaults = Settings::default();
        let interval = self.smoke_interval_minutes.or_else(|| {
            self.smoke_interval_hours
                .map(|hours| (hours * 60.0).round() as i64)
        });
        Settings {
            unit_price: self.pack_price.unwrap_or(defaults.unit_price),
            units_per_pack: self.pack_size.unwrap_or(defaults.units_per_pack),
            baseline_daily_count: self.old_habit.unwrap_or(defaults.baseline_daily_count),
            min_interval_minutes: interval.unwrap_or(defaults.min_interval_minutes),
            target_daily_count: self
                .desired_daily_sticks
                .unwrap_or(defaults.target_daily_count),
            settings_revision_time: 0,
        }
        .sanitized()
    }
}

impl LegacyDocument {
    fn into_document(self, fallback_start: EpochMillis) -> Document {
        let events = EventLog::from_events(self.smoke_history);
        // Documents that predate `appStartDate` begin at their first event.
        let profile_start_time = self
            .app_start_date
            .or_else(|| events.first().map(|e| e.timestamp))
            .unwrap_or(fallback_start);
        let longest = if self.longest_smoke_free_streak_hours.is_finite() {
            self.longest_smoke_free_streak_hours.max(0.0).floor() as u64
        } else {
            0
        };

        Document {
            settings: self.settings.into_settings(),
            profile: ProfileState {
                profile_start_time,
                longest_abstention_hours: longest,
                owner_id: self.current_user_id,
            },
            events,
            document_revision_time: 0,
        }
    }
}
