use ledger::{Document, EpochMillis, MILLIS_PER_DAY, MILLIS_PER_MINUTE};
use serde::{Deserialize, Serialize};

/// Dashboard figures for the day containing `now`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStats {
    pub events_today: usize,
    pub target_today: i64,
    pub spent_today: f64,
    pub planned_spend_today: f64,
    pub baseline_spend_per_day: f64,
    /// Value of the units not consumed compared to the baseline habit since the
    /// profile started.
    pub money_saved: f64,
    pub over_target: bool,
    /// Time left until the minimum interval after the last event has passed.
    pub next_allowed_in_ms: EpochMillis,
}

pub fn daily_stats(document: &Document, day_start: EpochMillis, now: EpochMillis) -> DailyStats {
    let settings = &document.settings;
    let price = settings.price_per_unit();

    let events_today = document
        .events
        .since(day_start)
        .iter()
        .take_while(|e| e.timestamp <= now)
        .count();

    let start = document.profile.profile_start_time;
    let consumed = document
        .events
        .since(start)
        .iter()
        .take_while(|e| e.timestamp <= now)
        .count();
    let days = now.saturating_sub(start).max(0) as f64 / MILLIS_PER_DAY as f64;
    let expected = days * settings.baseline_daily_count as f64;
    let money_saved = (expected - consumed as f64).floor().max(0.0) * price;

    let interval = settings
        .min_interval_minutes
        .max(0)
        .saturating_mul(MILLIS_PER_MINUTE);
    let next_allowed_in_ms = match document.last_event_time() {
        Some(last) => interval
            .saturating_sub(now.saturating_sub(last))
            .clamp(0, interval),
        None => 0,
    };

    DailyStats {
        events_today,
        target_today: settings.target_daily_count,
        spent_today: events_today as f64 * price,
        planned_spend_today: settings.target_daily_count as f64 * price,
        baseline_spend_per_day: settings.baseline_daily_count as f64 * price,
        money_saved,
        over_target: events_today as i64 > settings.target_daily_count,
        next_allowed_in_ms,
    }
}
