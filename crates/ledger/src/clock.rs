use chrono::{Local, TimeZone};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::EpochMillis;

/// Source of "now". Devices may disagree by a few seconds; callers that compare
/// instants from different replicas must allow for that skew.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> EpochMillis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> EpochMillis {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Settable clock shared between clones. Used for replays and tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn set(&self, now: EpochMillis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: EpochMillis) -> EpochMillis {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

/// Midnight (local time zone) of the day containing `now`. Falls back to `now`
/// itself when the local midnight does not exist (DST gaps).
pub fn start_of_local_day(now: EpochMillis) -> EpochMillis {
    let Some(local) = Local.timestamp_millis_opt(now).single() else {
        return now;
    };
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MILLIS_PER_DAY;

    #[test]
    fn manual_clock_is_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        assert_eq!(other.advance(500), 1_500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(42);
        assert_eq!(other.now_millis(), 42);
    }

    #[test]
    fn local_day_start_is_not_after_now() {
        let now = 1_700_000_123_456;
        let start = start_of_local_day(now);
        assert!(start <= now);
        // DST transitions can stretch a day by an hour.
        assert!(now - start < MILLIS_PER_DAY + 3_600_000);
    }
}
