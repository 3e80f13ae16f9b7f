//! Shared runtime context.
//!
//! One [`CacheContext`] is built at startup and handed to the orchestrator, the
//! invalidation coordinator, and the warming scheduler. It replaces process-wide
//! singletons so tests can run isolated instances side by side.

use std::fmt;
use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

use crate::events::{CacheEvent, EventQueue};
use crate::invalidation::{VersionGenerator, VersionStrategy};
use crate::lock::mutex_lock;

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for deterministic tests and replays.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *mutex_lock(&self.now, "context::clock", "set") = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, "context::clock", "advance");
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, "context::clock", "now")
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.now())
            .finish()
    }
}

/// Monitoring events kept for observers; older ones are evicted first.
pub const MONITORING_QUEUE_LIMIT: usize = 1_024;

/// Explicit dependencies shared by all cache components.
#[derive(Clone)]
pub struct CacheContext {
    clock: Arc<dyn Clock>,
    versions: Arc<VersionGenerator>,
    events: Arc<EventQueue<CacheEvent>>,
}

impl CacheContext {
    pub fn new(
        clock: Arc<dyn Clock>,
        versions: Arc<VersionGenerator>,
        events: Arc<EventQueue<CacheEvent>>,
    ) -> Self {
        Self {
            clock,
            versions,
            events,
        }
    }

    /// System clock, the given version strategy, and a fresh monitoring queue.
    pub fn with_strategy(strategy: VersionStrategy) -> Self {
        Self::new(
            Arc::new(SystemClock),
            Arc::new(VersionGenerator::new(strategy)),
            Arc::new(EventQueue::ring("monitoring", MONITORING_QUEUE_LIMIT)),
        )
    }

    /// Replace the clock, keeping everything else.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn versions(&self) -> &Arc<VersionGenerator> {
        &self.versions
    }

    /// Monitoring event queue. Observers may drain it; if nobody does it keeps the
    /// newest [`MONITORING_QUEUE_LIMIT`] events.
    pub fn events(&self) -> &Arc<EventQueue<CacheEvent>> {
        &self.events
    }

    /// Publish a monitoring event, evicting the oldest one when the queue is full.
    pub(crate) fn emit(&self, event: CacheEvent) {
        self.events.publish(event);
    }
}

impl Default for CacheContext {
    fn default() -> Self {
        Self::with_strategy(VersionStrategy::default())
    }
}

impl fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheContext")
            .field("strategy", &self.versions.strategy())
            .field("pending_events", &self.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(datetime!(2024-05-01 10:00 UTC));
        clock.advance(Duration::minutes(90));
        assert_eq!(clock.now(), datetime!(2024-05-01 11:30 UTC));
    }

    #[test]
    fn contexts_are_isolated() {
        let a = CacheContext::default();
        let b = CacheContext::default();
        a.emit(CacheEvent::Cleared);
        assert_eq!(a.events().len(), 1);
        assert!(b.events().is_empty());
    }
}
