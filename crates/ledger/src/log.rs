use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{EpochMillis, LoggedEvent};

/// Append-mostly history, kept sorted ascending by timestamp with no two
/// entries sharing a timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<LoggedEvent>", into = "Vec<LoggedEvent>")]
pub struct EventLog {
    events: Vec<LoggedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from events in any order. On a timestamp collision the
    /// first occurrence wins.
    pub fn from_events(events: impl IntoIterator<Item = LoggedEvent>) -> Self {
        let mut events: Vec<LoggedEvent> = events.into_iter().collect();
        events.sort_by_key(|e| e.timestamp);
        events.dedup_by_key(|e| e.timestamp);
        Self { events }
    }

    /// Inserts `event` in timestamp order. Returns false when an event with the
    /// same timestamp already exists; the new one is dropped.
    pub fn append(&mut self, event: LoggedEvent) -> bool {
        match self
            .events
            .binary_search_by_key(&event.timestamp, |e| e.timestamp)
        {
            Ok(_) => false,
            Err(index) => {
                self.events.insert(index, event);
                true
            }
        }
    }

    /// Removes and returns the most recent event.
    pub fn remove_last(&mut self) -> Option<LoggedEvent> {
        self.events.pop()
    }

    /// Deduplicated, timestamp-sorted merge of two logs. Pure, commutative and
    /// idempotent. If both sides hold an event at the same instant with
    /// different kinds, the costlier kind is kept so the result does not depend
    /// on argument order.
    pub fn union(a: &EventLog, b: &EventLog) -> EventLog {
        let (left, right) = (&a.events, &b.events);
        let mut merged = Vec::with_capacity(left.len().max(right.len()));
        let (mut i, mut j) = (0, 0);

        while i < left.len() && j < right.len() {
            match left[i].timestamp.cmp(&right[j].timestamp) {
                Ordering::Less => {
                    merged.push(left[i]);
                    i += 1;
                }
                Ordering::Greater => {
                    merged.push(right[j]);
                    j += 1;
                }
                Ordering::Equal => {
                    let kind = left[i].kind.max(right[j].kind);
                    merged.push(LoggedEvent::new(left[i].timestamp, kind));
                    i += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&left[i..]);
        merged.extend_from_slice(&right[j..]);

        EventLog { events: merged }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first(&self) -> Option<&LoggedEvent> {
        self.events.first()
    }

    pub fn last(&self) -> Option<&LoggedEvent> {
        self.events.last()
    }

    pub fn contains(&self, timestamp: EpochMillis) -> bool {
        self.events
            .binary_search_by_key(&timestamp, |e| e.timestamp)
            .is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LoggedEvent> {
        self.events.iter()
    }

    pub fn as_slice(&self) -> &[LoggedEvent] {
        &self.events
    }

    /// Events with `timestamp >= start`.
    pub fn since(&self, start: EpochMillis) -> &[LoggedEvent] {
        let index = self.events.partition_point(|e| e.timestamp < start);
        &self.events[index..]
    }
}

impl From<Vec<LoggedEvent>> for EventLog {
    fn from(events: Vec<LoggedEvent>) -> Self {
        Self::from_events(events)
    }
}

impl From<EventLog> for Vec<LoggedEvent> {
    fn from(log: EventLog) -> Self {
        log.events
    }
}

impl<'a> IntoIterator for &'a EventLog {
    type Item = &'a LoggedEvent;
    type IntoIter = std::slice::Iter<'a, LoggedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    fn log_of(timestamps: &[EpochMillis]) -> EventLog {
        EventLog::from_events(timestamps.iter().map(|t| LoggedEvent::normal(*t)))
    }

    fn timestamps(log: &EventLog) -> Vec<EpochMillis> {
        log.iter().map(|e| e.timestamp).collect()
    }

    #[test]
    fn append_keeps_order() {
        let mut log = EventLog::new();
        assert!(log.append(LoggedEvent::normal(30)));
        assert!(log.append(LoggedEvent::normal(10)));
        assert!(log.append(LoggedEvent::override_at(20)));
        assert_eq!(timestamps(&log), vec![10, 20, 30]);
    }

    #[test]
    fn colliding_append_is_dropped() {
        let mut log = log_of(&[10]);
        assert!(!log.append(LoggedEvent::override_at(10)));
        assert_eq!(log.len(), 1);
        assert_eq!(log.last().unwrap().kind, EventKind::Normal);
    }

    #[test]
    fn remove_last_pops_newest() {
        let mut log = log_of(&[5, 1, 3]);
        assert_eq!(log.remove_last(), Some(LoggedEvent::normal(5)));
        assert_eq!(timestamps(&log), vec![1, 3]);

        let mut empty = EventLog::new();
        assert_eq!(empty.remove_last(), None);
    }

    #[test]
    fn remove_last_undoes_append() {
        let original = log_of(&[1, 2, 3]);
        let mut log = original.clone();
        log.append(LoggedEvent::override_at(4));
        log.remove_last();
        assert_eq!(log, original);
    }

    #[test]
    fn union_merges_and_dedups() {
        let a = log_of(&[1, 3, 5]);
        let b = log_of(&[2, 3, 6]);
        assert_eq!(timestamps(&EventLog::union(&a, &b)), vec![1, 2, 3, 5, 6]);
        assert_eq!(EventLog::union(&a, &b), EventLog::union(&b, &a));
        assert_eq!(EventLog::union(&a, &a), a);
        assert_eq!(EventLog::union(&a, &EventLog::new()), a);
    }

    #[test]
    fn union_collision_keeps_costlier_kind() {
        let a = EventLog::from_events([LoggedEvent::normal(7)]);
        let b = EventLog::from_events([LoggedEvent::override_at(7)]);
        let merged = EventLog::union(&a, &b);
        assert_eq!(merged.as_slice(), &[LoggedEvent::override_at(7)]);
        assert_eq!(merged, EventLog::union(&b, &a));
    }

    #[test]
    fn since_returns_suffix() {
        let log = log_of(&[10, 20, 30]);
        assert_eq!(log.since(20).len(), 2);
        assert_eq!(log.since(31).len(), 0);
        assert_eq!(log.since(0).len(), 3);
    }

    #[test]
    fn deserializing_normalizes_order() {
        let log: EventLog = serde_json::from_str("[30, 10, 10, 20]").unwrap();
        assert_eq!(timestamps(&log), vec![10, 20, 30]);
    }
}
