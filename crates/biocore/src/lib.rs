//! Derived "organism" state, replayed from the event log.
//!
//! Nothing here is stored: health and growth are recomputed from the log and
//! the profile start on every read, so two replicas holding the same log
//! always agree regardless of how their copies were merged.
use ledger::{EpochMillis, EventKind, EventLog, MILLIS_PER_HOUR};
use serde::{Deserialize, Serialize};

mod stage;
pub use stage::*;
mod stats;
pub use stats::*;

pub const FULL_INTEGRITY: f64 = 100.0;

/// Regeneration and penalty constants. Product tuning values, loaded from
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BioCoreConfig {
    /// Integrity points regained per hour without events.
    pub regen_percent_per_hour: f64,
    pub normal_integrity_penalty: f64,
    pub override_integrity_penalty: f64,
    /// Growth time forfeited per event.
    pub normal_growth_penalty_ms: EpochMillis,
    pub override_growth_penalty_ms: EpochMillis,
}

impl Default for BioCoreConfig {
    fn default() -> Self {
        Self {
            regen_percent_per_hour: 2.0,
            normal_integrity_penalty: 5.0,
            override_integrity_penalty: 10.0,
            normal_growth_penalty_ms: MILLIS_PER_HOUR,
            override_growth_penalty_ms: 2 * MILLIS_PER_HOUR,
        }
    }
}

impl BioCoreConfig {
    pub fn integrity_penalty(&self, kind: EventKind) -> f64 {
        match kind {
            EventKind::Normal => self.normal_integrity_penalty,
            EventKind::Override => self.override_integrity_penalty,
        }
    }

    pub fn growth_penalty_ms(&self, kind: EventKind) -> EpochMillis {
        match kind {
            EventKind::Normal => self.normal_growth_penalty_ms,
            EventKind::Override => self.override_growth_penalty_ms,
        }
    }

    fn regenerate(&self, integrity: f64, elapsed_ms: EpochMillis) -> f64 {
        if elapsed_ms <= 0 {
            return integrity;
        }
        let hours = elapsed_ms as f64 / MILLIS_PER_HOUR as f64;
        (integrity + hours * self.regen_percent_per_hour).min(FULL_INTEGRITY)
    }
}

/// Point-in-time metrics produced by [`compute_state`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BioState {
    /// 0..=100.
    pub integrity: f64,
    pub evolution_duration_ms: EpochMillis,
    pub current_abstention_ms: EpochMillis,
    /// Longest event-free stretch seen during the replay, including the
    /// current one.
    pub longest_abstention_ms: EpochMillis,
}

impl BioState {
    pub fn stage(&self) -> EvolutionStage {
        EvolutionStage::from_evolution(self.evolution_duration_ms)
    }

    pub fn current_abstention_hours(&self) -> u64 {
        (self.current_abstention_ms / MILLIS_PER_HOUR).max(0) as u64
    }

    pub fn longest_abstention_hours(&self) -> u64 {
        (self.longest_abstention_ms / MILLIS_PER_HOUR).max(0) as u64
    }
}

/// Replays `events` from `profile_start_time` up to `now`.
///
/// Integrity starts full, regenerates linearly between events (capped at
/// full) and drops by a kind-dependent penalty at each event. Evolution is the
/// elapsed profile time minus a per-event growth penalty, floored at zero.
/// Events before the profile start or after `now` are ignored.
pub fn compute_state(
    events: &EventLog,
    profile_start_time: EpochMillis,
    now: EpochMillis,
    config: &BioCoreConfig,
) -> BioState {
    let mut integrity = FULL_INTEGRITY;
    let mut cursor = profile_start_time;
    let mut growth_penalty: EpochMillis = 0;
    let mut longest_gap: EpochMillis = 0;

    for event in events
        .iter()
        .filter(|e| e.timestamp >= profile_start_time && e.timestamp <= now)
    {
        let elapsed = event.timestamp.saturating_sub(cursor);
        longest_gap = longest_gap.max(elapsed);
        integrity = config.regenerate(integrity, elapsed);
        integrity = (integrity - config.integrity_penalty(event.kind)).max(0.0);
        growth_penalty = growth_penalty.saturating_add(config.growth_penalty_ms(event.kind));
        cursor = event.timestamp;
    }

    let current_abstention = now.saturating_sub(cursor).max(0);
    longest_gap = longest_gap.max(current_abstention);
    integrity = config.regenerate(integrity, current_abstention);

    let lived = now.saturating_sub(profile_start_time).max(0);
    BioState {
        integrity,
        evolution_duration_ms: lived.saturating_sub(growth_penalty).max(0),
        current_abstention_ms: current_abstention,
        longest_abstention_ms: longest_gap,
    }
}
