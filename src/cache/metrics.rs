//! Aggregate orchestrator metrics, updated in O(1) per operation.

use std::sync::Mutex;

use crate::lock::mutex_lock;

const SOURCE: &str = "cache::metrics";

/// Point-in-time view of orchestrator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub layer_errors: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    /// Running mean over every timed operation.
    pub average_response_time_ms: f64,
    pub timed_operations: u64,
}

#[derive(Default)]
pub(crate) struct OrchestratorMetrics {
    state: Mutex<MetricsSnapshot>,
}

impl OrchestratorMetrics {
    pub(crate) fn record_get(&self, hit: bool, elapsed_ms: f64) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_get");
        state.gets += 1;
        if hit {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        let gets = state.gets as f64;
        state.hit_rate = state.hits as f64 / gets;
        state.miss_rate = state.misses as f64 / gets;
        Self::fold_response_time(&mut state, elapsed_ms);
    }

    pub(crate) fn record_set(&self, elapsed_ms: f64) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_set");
        state.sets += 1;
        Self::fold_response_time(&mut state, elapsed_ms);
    }

    pub(crate) fn record_delete(&self, elapsed_ms: f64) {
        let mut state = mutex_lock(&self.state, SOURCE, "record_delete");
        state.deletes += 1;
        Self::fold_response_time(&mut state, elapsed_ms);
    }

    pub(crate) fn record_layer_errors(&self, count: usize) {
        if count > 0 {
            mutex_lock(&self.state, SOURCE, "record_layer_errors").layer_errors += count as u64;
        }
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        *mutex_lock(&self.state, SOURCE, "snapshot")
    }

    fn fold_response_time(state: &mut MetricsSnapshot, elapsed_ms: f64) {
        state.timed_operations += 1;
        state.average_response_time_ms +=
            (elapsed_ms - state.average_response_time_ms) / state.timed_operations as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_follow_each_get() {
        let metrics = OrchestratorMetrics::default();
        metrics.record_get(true, 1.0);
        metrics.record_get(false, 3.0);
        metrics.record_get(true, 2.0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gets, 3);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.miss_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.average_response_time_ms - 2.0).abs() < 1e-9);
    }

    #[test]
    fn running_mean_includes_writes() {
        let metrics = OrchestratorMetrics::default();
        metrics.record_set(4.0);
        metrics.record_delete(2.0);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timed_operations, 2);
        assert!((snapshot.average_response_time_ms - 3.0).abs() < 1e-9);
        assert_eq!(snapshot.hit_rate, 0.0);
    }
}
