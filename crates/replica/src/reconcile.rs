use ledger::{Document, EpochMillis, EventLog, ProfileState, Settings};

use crate::ReconcileConfig;

/// Which side's wipe was honored instead of unioning the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetSource {
    /// The remote is empty and clearly newer: another session reset.
    Remote,
    /// The local document is empty and clearly newer: a reset made here has
    /// not reached the remote yet.
    LocalPending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub document: Document,
    /// The merged document differs from what the remote holds.
    pub push_remote: bool,
    /// The merged document differs from the local copy.
    pub persist_local: bool,
    pub reset: Option<ResetSource>,
}

/// Merges the local and remote replicas into one document.
///
/// Pure: the same inputs always produce the same outcome, and merging the
/// result with either input again yields the result.
pub fn reconcile(
    local: Option<&Document>,
    remote: Option<&Document>,
    now: EpochMillis,
    config: &ReconcileConfig,
) -> ReconcileOutcome {
    match (local, remote) {
        (None, None) => ReconcileOutcome {
            document: Document::new_default(now),
            push_remote: true,
            persist_local: true,
            reset: None,
        },
        (Some(local), None) => ReconcileOutcome {
            document: local.clone(),
            push_remote: true,
            persist_local: false,
            reset: None,
        },
        (None, Some(remote)) => ReconcileOutcome {
            document: remote.clone(),
            push_remote: false,
            persist_local: true,
            reset: None,
        },
        (Some(local), Some(remote)) => {
            let (document, reset) = merge(local, remote, config.reset_skew_tolerance_ms);
            ReconcileOutcome {
                push_remote: document != *remote,
                persist_local: document != *local,
                document,
                reset,
            }
        }
    }
}

fn merge(
    local: &Document,
    remote: &Document,
    tolerance_ms: EpochMillis,
) -> (Document, Option<ResetSource>) {
    let reset = detect_reset(local, remote, tolerance_ms);

    let settings = newer_settings(&local.settings, &remote.settings).clone();

    let events = match reset {
        Some(_) => EventLog::new(),
        None => EventLog::union(&local.events, &remote.events),
    };

    // Ties go to local.
    let fresher = if remote.document_revision_time > local.document_revision_time {
        remote
    } else {
        local
    };
    let other = if std::ptr::eq(fresher, local) { remote } else { local };

    let longest_abstention_hours = match reset {
        Some(ResetSource::Remote) => remote.profile.longest_abstention_hours,
        Some(ResetSource::LocalPending) => local.profile.longest_abstention_hours,
        None => local
            .profile
            .longest_abstention_hours
            .max(remote.profile.longest_abstention_hours),
    };

    let profile = ProfileState {
        profile_start_time: fresher.profile.profile_start_time,
        longest_abstention_hours,
        owner_id: fresher
            .profile
            .owner_id
            .clone()
            .or_else(|| other.profile.owner_id.clone()),
    };

    let document = Document {
        settings,
        profile,
        events,
        document_revision_time: fresher.document_revision_time,
    };
    (document, reset)
}

/// An empty side whose revision is newer than the other by more than the skew
/// tolerance is an intentional wipe, not a replica that missed events.
fn detect_reset(
    local: &Document,
    remote: &Document,
    tolerance_ms: EpochMillis,
) -> Option<ResetSource> {
    let remote_ahead = remote
        .document_revision_time
        .saturating_sub(local.document_revision_time);
    let local_ahead = local
        .document_revision_time
        .saturating_sub(remote.document_revision_time);
    if remote.events.is_empty() && !local.events.is_empty() && remote_ahead > tolerance_ms {
        return Some(ResetSource::Remote);
    }
    if local.events.is_empty() && !remote.events.is_empty() && local_ahead > tolerance_ms {
        return Some(ResetSource::LocalPending);
    }
    None
}

/// Strictly newer remote settings win; ties keep local.
fn newer_settings<'a>(local: &'a Settings, remote: &'a Settings) -> &'a Settings {
    if remote.settings_revision_time > local.settings_revision_time {
        remote
    } else {
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger::{EventKind, LoggedEvent};

    fn config() -> ReconcileConfig {
        ReconcileConfig::default()
    }

    fn doc(events: &[i64], revision: EpochMillis) -> Document {
        let mut doc = Document::new_default(0);
        doc.profile.profile_start_time = 0;
        doc.events = EventLog::from_events(events.iter().copied().map(LoggedEvent::normal));
        doc.document_revision_time = revision;
        doc
    }

    fn timestamps(doc: &Document) -> Vec<i64> {
        doc.events.iter().map(|e| e.timestamp).collect()
    }

    #[test]
    fn both_absent_creates_default_and_pushes() {
        let outcome = reconcile(None, None, 10_000, &config());
        assert!(outcome.push_remote);
        assert!(outcome.persist_local);
        assert!(outcome.document.events.is_empty());
        assert_eq!(outcome.document.document_revision_time, 0);
    }

    #[test]
    fn absent_remote_adopts_local_and_pushes() {
        let local = doc(&[1, 2], 50);
        let outcome = reconcile(Some(&local), None, 100, &config());
        assert_eq!(outcome.document, local);
        assert!(outcome.push_remote);
        assert!(!outcome.persist_local);
    }

    #[test]
    fn absent_local_adopts_remote() {
        let remote = doc(&[1, 2], 50);
        let outcome = reconcile(None, Some(&remote), 100, &config());
        assert_eq!(outcome.document, remote);
        assert!(!outcome.push_remote);
        assert!(outcome.persist_local);
    }

    #[test]
    fn disjoint_logs_union() {
        let local = doc(&[1_000, 3_000], 3_000);
        let remote = doc(&[2_000, 4_000], 4_000);
        let outcome = reconcile(Some(&local), Some(&remote), 5_000, &config());

        assert_eq!(timestamps(&outcome.document), vec![1_000, 2_000, 3_000, 4_000]);
        assert_eq!(outcome.document.document_revision_time, 4_000);
        assert!(outcome.push_remote);
        assert!(outcome.persist_local);
        assert_eq!(outcome.reset, None);
    }

    #[test]
    fn merge_is_idempotent() {
        let local = doc(&[1_000, 3_000], 3_000);
        let remote = doc(&[2_000], 9_000);
        let first = reconcile(Some(&local), Some(&remote), 10_000, &config()).document;

        let again = reconcile(Some(&first), Some(&first), 10_000, &config());
        assert_eq!(again.document, first);
        assert!(!again.push_remote);
        assert!(!again.persist_local);

        let with_local = reconcile(Some(&first), Some(&local), 10_000, &config());
        assert_eq!(with_local.document, first);
        let with_remote = reconcile(Some(&first), Some(&remote), 10_000, &config());
        assert_eq!(with_remote.document, first);
    }

    #[test]
    fn no_event_is_lost_without_reset() {
        let local = doc(&[10, 20, 30], 100);
        let remote = doc(&[15, 25], 102);
        let merged = reconcile(Some(&local), Some(&remote), 200, &config()).document;
        for e in local.events.iter().chain(remote.events.iter()) {
            assert!(merged.events.contains(e.timestamp));
        }
    }

    fn fifty_events() -> Vec<i64> {
        (1..=50).map(|i| i * 1_000).collect()
    }

    #[test]
    fn newer_empty_remote_is_a_reset() {
        let local = doc(&fifty_events(), 50_000);
        let remote = doc(&[], 60_000);
        let outcome = reconcile(Some(&local), Some(&remote), 60_500, &config());

        assert_eq!(outcome.reset, Some(ResetSource::Remote));
        assert!(outcome.document.events.is_empty());
        assert_eq!(outcome.document.document_revision_time, 60_000);
        assert!(!outcome.push_remote);
    }

    #[test]
    fn empty_remote_within_tolerance_is_not_a_reset() {
        let local = doc(&fifty_events(), 50_000);
        let remote = doc(&[], 51_000);
        let outcome = reconcile(Some(&local), Some(&remote), 51_500, &config());

        assert_eq!(outcome.reset, None);
        assert_eq!(timestamps(&outcome.document), fifty_events());
        assert!(outcome.push_remote);
    }

    #[test]
    fn pending_local_reset_survives_stale_remote() {
        let local = doc(&[], 60_000);
        let remote = doc(&[1_000, 2_000], 2_000);
        let outcome = reconcile(Some(&local), Some(&remote), 61_000, &config());

        assert_eq!(outcome.reset, Some(ResetSource::LocalPending));
        assert!(outcome.document.events.is_empty());
        assert!(outcome.push_remote);
        assert!(!outcome.persist_local);
    }

    #[test]
    fn fresh_device_never_wipes_remote() {
        let local = doc(&[], 0);
        let remote = doc(&[1_000], 1_000);
        let outcome = reconcile(Some(&local), Some(&remote), 99_000, &config());
        assert_eq!(outcome.reset, None);
        assert_eq!(timestamps(&outcome.document), vec![1_000]);
    }

    #[test]
    fn strictly_newer_settings_win() {
        let mut local = doc(&[], 0);
        local.settings.unit_price = 5.0;
        local.settings.settings_revision_time = 100;
        let mut remote = doc(&[], 0);
        remote.settings.unit_price = 9.0;
        remote.settings.settings_revision_time = 101;

        let merged = reconcile(Some(&local), Some(&remote), 200, &config()).document;
        assert_eq!(merged.settings.unit_price, 9.0);

        remote.settings.settings_revision_time = 100;
        let merged = reconcile(Some(&local), Some(&remote), 200, &config()).document;
        assert_eq!(merged.settings.unit_price, 5.0);
    }

    #[test]
    fn longest_record_takes_max_without_reset() {
        let mut local = doc(&[1], 10);
        local.profile.longest_abstention_hours = 40;
        let mut remote = doc(&[2], 20);
        remote.profile.longest_abstention_hours = 12;
        let merged = reconcile(Some(&local), Some(&remote), 30, &config()).document;
        assert_eq!(merged.profile.longest_abstention_hours, 40);
    }

    #[test]
    fn reset_takes_record_from_resetting_side() {
        let mut local = doc(&[1_000], 1_000);
        local.profile.longest_abstention_hours = 40;
        let remote = doc(&[], 30_000);
        let merged = reconcile(Some(&local), Some(&remote), 31_000, &config()).document;
        assert_eq!(merged.profile.longest_abstention_hours, 0);
    }

    #[test]
    fn profile_and_owner_follow_fresher_side() {
        let mut local = doc(&[1], 10).with_owner("alice");
        local.profile.profile_start_time = 5;
        let mut remote = doc(&[2], 20);
        remote.profile.profile_start_time = 7;
        remote.profile.owner_id = None;

        let merged = reconcile(Some(&local), Some(&remote), 30, &config()).document;
        assert_eq!(merged.profile.profile_start_time, 7);
        assert_eq!(merged.profile.owner_id.as_deref(), Some("alice"));
    }

    #[test]
    fn extreme_revisions_do_not_overflow() {
        let local = doc(&[1_000], EpochMillis::MIN);
        let remote = doc(&[], EpochMillis::MAX);
        let outcome = reconcile(Some(&local), Some(&remote), 0, &config());
        assert_eq!(outcome.reset, Some(ResetSource::Remote));

        let outcome = reconcile(Some(&remote), Some(&local), 0, &config());
        assert_eq!(outcome.reset, Some(ResetSource::LocalPending));
    }

    #[test]
    fn colliding_timestamps_keep_override() {
        let local = doc(&[500], 10);
        let mut remote = doc(&[], 20);
        remote.events.append(LoggedEvent::new(500, EventKind::Override));

        let merged = reconcile(Some(&local), Some(&remote), 30, &config()).document;
        assert_eq!(merged.events.len(), 1);
        assert_eq!(merged.events.first().map(|e| e.kind), Some(EventKind::Override));
    }
}
