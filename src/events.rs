//! Typed event queues.
//!
//! Components never call each other through hidden emitters. Each producer is
//! handed an `Arc<EventQueue<T>>` for the payload type its consumer expects:
//! invalidation intents, warming data, or monitoring [`CacheEvent`]s.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{CacheValue, SetOptions};
use crate::lock::mutex_lock;
use crate::warming::{WarmingData, WarmingSession};

const SOURCE: &str = "events";
const METRIC_QUEUE_LEN: &str = "tiercache_event_queue_len";
const METRIC_QUEUE_DROPPED: &str = "tiercache_event_dropped_total";

/// Default bound for queues built with [`EventQueue::new`].
pub const DEFAULT_QUEUE_LIMIT: usize = 10_000;

/// Monotonic per-queue sequence number.
pub type Epoch = u64;

/// A queued payload with idempotency and ordering metadata.
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch within the owning queue.
    pub epoch: Epoch,
    pub payload: T,
    pub timestamp: OffsetDateTime,
}

/// What a full queue gives up to make room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Reject the new payload and warn; for queues whose payloads must be applied.
    DropNewest,
    /// Evict the oldest payload quietly; for observation-only queues nobody may drain.
    DropOldest,
}

/// Bounded FIFO queue shared between one producer side and one consumer side.
///
/// With [`Overflow::DropNewest`] publishing into a full queue drops the new payload
/// and counts it; the caller learns about it through the `false` return value.
/// With [`Overflow::DropOldest`] the oldest pending payload is evicted instead.
pub struct EventQueue<T> {
    name: &'static str,
    limit: usize,
    overflow: Overflow,
    queue: Mutex<VecDeque<Envelope<T>>>,
    epoch_counter: AtomicU64,
    dropped: AtomicU64,
}

impl<T> EventQueue<T> {
    /// Create a queue bounded at [`DEFAULT_QUEUE_LIMIT`].
    pub fn new(name: &'static str) -> Self {
        Self::with_limit(name, DEFAULT_QUEUE_LIMIT)
    }

    /// Create a queue holding at most `limit` pending payloads (minimum 1).
    pub fn with_limit(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            limit: limit.max(1),
            overflow: Overflow::DropNewest,
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Ring buffer keeping the newest `limit` payloads.
    pub fn ring(name: &'static str, limit: usize) -> Self {
        Self {
            overflow: Overflow::DropOldest,
            ..Self::with_limit(name, limit)
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Append a payload. Returns false if the queue was full and the payload dropped.
    pub fn publish(&self, payload: T) -> bool {
        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if queue.len() >= self.limit {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_QUEUE_DROPPED, "queue" => self.name).increment(1);
            match self.overflow {
                Overflow::DropNewest => {
                    drop(queue);
                    warn!(
                        queue = self.name,
                        limit = self.limit,
                        "Event queue full, payload dropped"
                    );
                    return false;
                }
                Overflow::DropOldest => {
                    queue.pop_front();
                }
            }
        }

        let envelope = Envelope {
            id: Uuid::new_v4(),
            epoch: self.next_epoch(),
            payload,
            timestamp: OffsetDateTime::now_utc(),
        };
        debug!(
            queue = self.name,
            event_id = %envelope.id,
            event_epoch = envelope.epoch,
            "Event enqueued"
        );
        queue.push_back(envelope);
        gauge!(METRIC_QUEUE_LEN, "queue" => self.name).set(queue.len() as f64);
        true
    }

    /// Remove up to `limit` payloads in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<Envelope<T>> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN, "queue" => self.name).set(queue.len() as f64);
        drained
    }

    /// Remove every pending payload.
    pub fn drain_all(&self) -> Vec<Envelope<T>> {
        self.drain(usize::MAX)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of payloads rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN, "queue" => self.name).set(0.0);
    }
}

impl<T: Clone> EventQueue<T> {
    /// Copy pending payloads without consuming them.
    pub fn snapshot(&self) -> Vec<T> {
        mutex_lock(&self.queue, SOURCE, "snapshot")
            .iter()
            .map(|envelope| envelope.payload.clone())
            .collect()
    }
}

/// What an invalidation touched, as reported to monitoring.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidatedScope {
    Tags(Vec<String>),
    Patterns(Vec<String>),
}

/// Lifecycle events for external monitoring collaborators.
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Hit {
        layer: String,
        key: String,
        response_time_ms: f64,
    },
    Miss {
        key: String,
        response_time_ms: f64,
    },
    Set {
        key: String,
        value: CacheValue,
        options: SetOptions,
    },
    Deleted {
        key: String,
        removed: bool,
    },
    Cleared,
    Invalidated(InvalidatedScope),
    WarmingData(WarmingData),
    SessionCompleted {
        session: WarmingSession,
    },
    SessionFailed {
        session: WarmingSession,
        error: String,
    },
}

impl CacheEvent {
    /// Short label used in logs and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hit { .. } => "hit",
            Self::Miss { .. } => "miss",
            Self::Set { .. } => "set",
            Self::Deleted { .. } => "deleted",
            Self::Cleared => "cleared",
            Self::Invalidated(_) => "invalidated",
            Self::WarmingData(_) => "warming_data",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn publish_and_drain_fifo() {
        let queue = EventQueue::new("test");
        queue.publish("a");
        queue.publish("b");
        queue.publish("c");
        assert_eq!(queue.len(), 3);

        let drained = queue.drain(2);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, "a");
        assert_eq!(drained[1].payload, "b");
        assert!(drained[0].epoch < drained[1].epoch);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_more_than_available() {
        let queue = EventQueue::new("test");
        queue.publish(1);

        assert_eq!(queue.drain(100).len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let queue = EventQueue::with_limit("test", 1);
        assert!(queue.publish(1));
        assert!(!queue.publish(2));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.snapshot(), vec![1]);
    }

    #[test]
    fn ring_keeps_the_newest_payloads() {
        let queue = EventQueue::ring("test", 3);
        for n in 0..(DEFAULT_QUEUE_LIMIT + 50) {
            assert!(queue.publish(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), (DEFAULT_QUEUE_LIMIT + 47) as u64);
        assert_eq!(
            queue.snapshot(),
            vec![
                DEFAULT_QUEUE_LIMIT + 47,
                DEFAULT_QUEUE_LIMIT + 48,
                DEFAULT_QUEUE_LIMIT + 49
            ]
        );
        let epochs: Vec<Epoch> = queue.drain_all().iter().map(|envelope| envelope.epoch).collect();
        assert!(epochs.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn queue_recovers_from_poisoned_lock() {
        let queue = EventQueue::new("test");

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = queue.queue.lock().expect("queue lock should be acquired");
            panic!("poison queue lock");
        }));

        queue.publish(7);
        assert_eq!(queue.len(), 1);
    }
}
