//! Layer and orchestrator configuration.
//!
//! Built from the `[[layers]]` and `[orchestrator]` sections of `tiercache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_LAYER_TTL_SECS: u64 = 300;
const DEFAULT_LAYER_MAX_ENTRIES: usize = 1_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Configuration for one in-memory layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Unique layer name, e.g. `memory` or `edge`.
    pub name: String,
    /// Default TTL applied when a write does not carry one. Zero disables expiry.
    pub default_ttl_seconds: u64,
    /// Capacity before LRU eviction.
    pub max_entries: usize,
    /// Reject writes; used for edge-style layers that are populated elsewhere.
    pub read_only: bool,
    /// Interval of the background TTL sweep.
    pub sweep_interval_ms: u64,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            default_ttl_seconds: DEFAULT_LAYER_TTL_SECS,
            max_entries: DEFAULT_LAYER_MAX_ENTRIES,
            read_only: false,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl From<&crate::config::LayerSettings> for LayerConfig {
    fn from(settings: &crate::config::LayerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            default_ttl_seconds: settings.ttl_seconds,
            max_entries: settings.max_entries.get(),
            read_only: settings.read_only,
            sweep_interval_ms: settings.sweep_interval.as_millis() as u64,
        }
    }
}

impl LayerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Orchestrator and intent-consumer behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Spawn write-through-up back-fills instead of awaiting them inside `get`.
    pub detached_backfill: bool,
    /// Maximum intents applied per consumption pass.
    pub consume_batch_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            detached_backfill: false,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl From<&crate::config::OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: &crate::config::OrchestratorSettings) -> Self {
        Self {
            detached_backfill: settings.detached_backfill,
            consume_batch_limit: settings.consume_batch_limit.get(),
        }
    }
}
