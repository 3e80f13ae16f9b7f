//! Propagation configuration.

use std::time::Duration;

use serde::Deserialize;

const DEFAULT_MAX_DEPTH: usize = 5;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_DELAY_MS: u64 = 100;
const DEFAULT_DRAIN_INTERVAL_MS: u64 = 500;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    /// Hops followed along dependents edges for one propagating event.
    pub max_depth: usize,
    /// Events per batch in `invalidate_batch` and per propagation drain.
    pub batch_size: usize,
    /// Pause between batches.
    pub delay_ms: u64,
    /// Tick of the background propagation worker.
    pub drain_interval_ms: u64,
    /// Bound of the derived-event queue.
    pub queue_limit: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            batch_size: DEFAULT_BATCH_SIZE,
            delay_ms: DEFAULT_DELAY_MS,
            drain_interval_ms: DEFAULT_DRAIN_INTERVAL_MS,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl From<&crate::config::PropagationSettings> for PropagationConfig {
    fn from(settings: &crate::config::PropagationSettings) -> Self {
        Self {
            max_depth: settings.max_depth as usize,
            batch_size: settings.batch_size.get(),
            delay_ms: settings.delay.as_millis() as u64,
            drain_interval_ms: settings.drain_interval.as_millis() as u64,
            queue_limit: settings.queue_limit.get(),
        }
    }
}

impl PropagationConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}
