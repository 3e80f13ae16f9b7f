//! Per-key usage patterns.
//!
//! Patterns are updated from the read path, so every field is lock-free except
//! the user segment set.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use time::OffsetDateTime;

use crate::invalidation::unix_millis;
use crate::lock::mutex_lock;

const SOURCE: &str = "warming::usage";
const NEVER_SEEN: i64 = i64::MIN;

pub struct UsagePattern {
    id: String,
    frequency: AtomicU64,
    /// Bit `h` set when an access happened during UTC hour `h`.
    peak_hours: AtomicU32,
    user_segments: Mutex<BTreeSet<String>>,
    last_seen_ms: AtomicI64,
}

impl UsagePattern {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            frequency: AtomicU64::new(0),
            peak_hours: AtomicU32::new(0),
            user_segments: Mutex::new(BTreeSet::new()),
            last_seen_ms: AtomicI64::new(NEVER_SEEN),
        }
    }

    fn record(&self, at: OffsetDateTime, segment: Option<&str>) -> u64 {
        let frequency = self.frequency.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_hours
            .fetch_or(1 << u32::from(at.hour()), Ordering::Relaxed);
        self.last_seen_ms
            .fetch_max(unix_millis(at), Ordering::Relaxed);
        if let Some(segment) = segment {
            mutex_lock(&self.user_segments, SOURCE, "record").insert(segment.to_string());
        }
        frequency
    }

    fn snapshot(&self) -> UsagePatternSnapshot {
        let peak_mask = self.peak_hours.load(Ordering::Relaxed);
        let last_seen_ms = self.last_seen_ms.load(Ordering::Relaxed);
        UsagePatternSnapshot {
            id: self.id.clone(),
            frequency: self.frequency.load(Ordering::Relaxed),
            peak_hours: (0..24u8).filter(|hour| peak_mask & (1 << hour) != 0).collect(),
            user_segments: mutex_lock(&self.user_segments, SOURCE, "snapshot")
                .iter()
                .cloned()
                .collect(),
            last_seen_at: (last_seen_ms != NEVER_SEEN)
                .then(|| {
                    OffsetDateTime::from_unix_timestamp_nanos(i128::from(last_seen_ms) * 1_000_000)
                        .ok()
                })
                .flatten(),
        }
    }
}

/// Point-in-time copy of a [`UsagePattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct UsagePatternSnapshot {
    pub id: String,
    pub frequency: u64,
    pub peak_hours: Vec<u8>,
    pub user_segments: Vec<String>,
    pub last_seen_at: Option<OffsetDateTime>,
}

impl UsagePatternSnapshot {
    pub fn includes_hour(&self, hour: u8) -> bool {
        self.peak_hours.contains(&hour)
    }
}

#[derive(Default)]
pub struct UsageTracker {
    patterns: DashMap<String, Arc<UsagePattern>>,
}

impl UsageTracker {
    /// Count one access. Returns the new frequency.
    pub fn record(&self, key: &str, at: OffsetDateTime, segment: Option<&str>) -> u64 {
        let pattern = match self.patterns.get(key) {
            Some(existing) => Arc::clone(existing.value()),
            None => Arc::clone(
                self.patterns
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(UsagePattern::new(key)))
                    .value(),
            ),
        };
        pattern.record(at, segment)
    }

    pub fn get(&self, key: &str) -> Option<UsagePatternSnapshot> {
        self.patterns.get(key).map(|pattern| pattern.snapshot())
    }

    pub fn frequency(&self, key: &str) -> u64 {
        self.patterns
            .get(key)
            .map_or(0, |pattern| pattern.frequency.load(Ordering::Relaxed))
    }

    /// Forget everything recorded for `key`.
    pub fn reset(&self, key: &str) -> bool {
        self.patterns.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn record_tracks_hours_segments_and_last_seen() {
        let tracker = UsageTracker::default();
        tracker.record("k", datetime!(2024-05-01 09:10 UTC), Some("premium"));
        tracker.record("k", datetime!(2024-05-01 21:00 UTC), None);
        tracker.record("k", datetime!(2024-05-01 09:30 UTC), Some("free"));

        let pattern = tracker.get("k").expect("pattern");
        assert_eq!(pattern.frequency, 3);
        assert_eq!(pattern.peak_hours, vec![9, 21]);
        assert_eq!(pattern.user_segments, vec!["free", "premium"]);
        assert_eq!(pattern.last_seen_at, Some(datetime!(2024-05-01 21:00 UTC)));
        assert!(pattern.includes_hour(21));
    }

    #[test]
    fn reset_forgets_pattern() {
        let tracker = UsageTracker::default();
        tracker.record("k", datetime!(2024-05-01 09:10 UTC), None);
        assert!(tracker.reset("k"));
        assert_eq!(tracker.frequency("k"), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn concurrent_records_are_all_counted() {
        let tracker = Arc::new(UsageTracker::default());
        let at = datetime!(2024-05-01 09:10 UTC);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        tracker.record("hot", at, None);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(tracker.frequency("hot"), 8_000);
    }
}
