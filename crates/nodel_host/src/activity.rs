//! Bounded in-memory log of recent action, event and binding activity.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySource {
    Local,
    Remote,
    Unbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    Action,
    Event,
    ActionBinding,
    EventBinding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub source: ActivitySource,
    pub kind: ActivityKind,
    pub alias: String,
    pub arg: Value,
}

struct Ring {
    entries: VecDeque<ActivityEntry>,
    next_seq: u64,
}

pub struct ActivityLog {
    ring: Mutex<Ring>,
    capacity: usize,
}

impl ActivityLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
        }
    }

    /// Appends an entry, evicting the oldest when full. Returns its sequence
    /// number.
    pub fn append(
        &self,
        source: ActivitySource,
        kind: ActivityKind,
        alias: &str,
        arg: Value,
    ) -> u64 {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let mut ring = self.ring.lock();
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(ActivityEntry {
            seq,
            timestamp_ms,
            source,
            kind,
            alias: alias.to_string(),
            arg,
        });
        seq
    }

    /// Entries with a sequence number greater than `seq`, oldest first.
    pub fn since(&self, seq: u64) -> Vec<ActivityEntry> {
        self.ring
            .lock()
            .entries
            .iter()
            .filter(|e| e.seq > seq)
            .cloned()
            .collect()
    }

    /// The newest `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ActivityEntry> {
        let ring = self.ring.lock();
        let skip = ring.entries.len().saturating_sub(limit);
        ring.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ring_evicts_oldest() {
        let log = ActivityLog::new(3);
        for i in 0..5 {
            log.append(ActivitySource::Local, ActivityKind::Action, "Power", json!(i));
        }
        assert_eq!(log.len(), 3);
        let seqs: Vec<u64> = log.recent(10).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(log.recent(1)[0].arg, json!(4));
    }

    #[test]
    fn since_returns_newer_entries() {
        let log = ActivityLog::default();
        let first = log.append(ActivitySource::Remote, ActivityKind::Event, "Level", json!(1));
        log.append(ActivitySource::Unbound, ActivityKind::Action, "Power", Value::Null);
        let newer = log.since(first);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].source, ActivitySource::Unbound);
        assert!(log.since(first + 1).is_empty());
    }

    #[test]
    fn entries_serialize_with_lowercase_tags() {
        let log = ActivityLog::new(1);
        log.append(
            ActivitySource::Local,
            ActivityKind::ActionBinding,
            "Power",
            json!("Wired"),
        );
        let value = serde_json::to_value(&log.recent(1)[0]).unwrap();
        assert_eq!(value["source"], "local");
        assert_eq!(value["kind"], "actionBinding");
    }
}
