//! Warming scheduler configuration.

use std::time::Duration;

use serde::Deserialize;

use super::prediction::ModelKind;
use super::strategy::{PriorityAlgorithm, WarmingStrategy};

// Default values for warming configuration
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;
const DEFAULT_MAX_WARMING_TIME_MS: u64 = 30_000;
const DEFAULT_MAX_MEMORY_BYTES: usize = 50 * 1024 * 1024;
const DEFAULT_RATE_PER_SECOND: u32 = 10;
const DEFAULT_PRIORITY_LEVELS: u32 = 5;
const DEFAULT_POPULAR_TOP_N: usize = 10;
const DEFAULT_MODEL_REFRESH_INTERVAL_MS: u64 = 60 * 60 * 1000;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    /// Fetches in flight at once within one session.
    pub max_concurrent_requests: usize,
    /// Wall-clock budget per session. Targets not started in time are skipped.
    pub max_warming_time_ms: u64,
    /// Bytes a single session may fetch before further targets are skipped.
    pub max_memory_bytes: usize,
    /// Fetch starts per second; 0 disables limiting.
    pub rate_per_second: u32,
    pub priority_levels: u32,
    pub popular_top_n: usize,
    pub algorithm: PriorityAlgorithm,
    pub model: ModelKind,
    pub model_refresh_interval_ms: u64,
    /// Period of automatic sessions; 0 disables them.
    pub session_interval_ms: u64,
    pub session_strategy: WarmingStrategy,
    /// Finished sessions kept for inspection.
    pub history_limit: usize,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_warming_time_ms: DEFAULT_MAX_WARMING_TIME_MS,
            max_memory_bytes: DEFAULT_MAX_MEMORY_BYTES,
            rate_per_second: DEFAULT_RATE_PER_SECOND,
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            popular_top_n: DEFAULT_POPULAR_TOP_N,
            algorithm: PriorityAlgorithm::default(),
            model: ModelKind::default(),
            model_refresh_interval_ms: DEFAULT_MODEL_REFRESH_INTERVAL_MS,
            session_interval_ms: 0,
            session_strategy: WarmingStrategy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl From<&crate::config::WarmingSettings> for WarmingConfig {
    fn from(settings: &crate::config::WarmingSettings) -> Self {
        Self {
            max_concurrent_requests: settings.max_concurrent_requests.get(),
            max_warming_time_ms: settings.max_warming_time.as_millis() as u64,
            max_memory_bytes: settings.max_memory_bytes.get(),
            rate_per_second: settings.rate_per_second,
            priority_levels: settings.priority_levels.get(),
            popular_top_n: settings.popular_top_n.get(),
            algorithm: settings.algorithm,
            model: settings.model,
            model_refresh_interval_ms: settings.model_refresh_interval.as_millis() as u64,
            session_interval_ms: settings
                .session_interval
                .map_or(0, |interval| interval.as_millis() as u64),
            session_strategy: settings.session_strategy,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl WarmingConfig {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent_requests.max(1)
    }

    pub fn max_warming_time(&self) -> Duration {
        Duration::from_millis(self.max_warming_time_ms)
    }

    pub fn priority_levels(&self) -> u32 {
        self.priority_levels.max(1)
    }

    /// Targets at or above this priority are queued as soon as they are added.
    pub fn auto_queue_threshold(&self) -> u32 {
        self.priority_levels().saturating_sub(1)
    }

    /// Minimum priority selected by the critical strategy.
    pub fn critical_threshold(&self) -> u32 {
        self.priority_levels().saturating_sub(2)
    }

    pub fn model_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.model_refresh_interval_ms.max(1))
    }

    pub fn session_interval(&self) -> Option<Duration> {
        (self.session_interval_ms > 0).then(|| Duration::from_millis(self.session_interval_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_thresholds() {
        let config = WarmingConfig::default();
        assert_eq!(config.priority_levels(), 5);
        assert_eq!(config.auto_queue_threshold(), 4);
        assert_eq!(config.critical_threshold(), 3);
        assert_eq!(config.session_interval(), None);
        assert_eq!(config.max_warming_time(), Duration::from_secs(30));
    }

    #[test]
    fn degenerate_values_clamp() {
        let config = WarmingConfig {
            max_concurrent_requests: 0,
            priority_levels: 0,
            ..Default::default()
        };
        assert_eq!(config.max_concurrent(), 1);
        assert_eq!(config.priority_levels(), 1);
        assert_eq!(config.critical_threshold(), 0);
    }
}
