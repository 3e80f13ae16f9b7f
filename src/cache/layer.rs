//! The pluggable backend contract.

use async_trait::async_trait;

use super::entry::{CacheEntry, CacheValue, SetOptions};
use super::error::LayerError;
use crate::pattern::KeyPattern;

/// What a layer can do beyond the required operations.
///
/// Read once when the layer is registered with the orchestrator, not per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerCapabilities {
    /// Writes, deletes, and clears are skipped (e.g. an edge cache).
    pub read_only: bool,
    pub tag_invalidation: bool,
    pub pattern_invalidation: bool,
}

/// Partial metrics reported by a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
}

/// A cache backend with its own latency and durability profile.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Unique name within one orchestrator.
    fn name(&self) -> &str;

    fn capabilities(&self) -> LayerCapabilities {
        LayerCapabilities::default()
    }

    /// Returns `None` on a miss, including a lazily expired entry.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError>;

    async fn set(&self, key: &str, value: CacheValue, options: &SetOptions)
    -> Result<(), LayerError>;

    /// Returns true if an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, LayerError>;

    async fn clear(&self) -> Result<(), LayerError>;

    async fn has(&self, key: &str) -> Result<bool, LayerError>;

    async fn size(&self) -> Result<usize, LayerError>;

    fn metrics(&self) -> LayerMetrics;

    /// Remove entries carrying any of `tags`. Returns the number removed.
    async fn invalidate_by_tags(&self, _tags: &[String]) -> Result<usize, LayerError> {
        Err(LayerError::Unsupported {
            layer: self.name().to_string(),
            op: "invalidate_by_tags",
        })
    }

    /// Remove entries whose key matches `pattern`. Returns the number removed.
    async fn invalidate_by_pattern(&self, _pattern: &KeyPattern) -> Result<usize, LayerError> {
        Err(LayerError::Unsupported {
            layer: self.name().to_string(),
            op: "invalidate_by_pattern",
        })
    }

    /// Drop expired entries proactively. Layers with native expiry can keep the default.
    async fn sweep_expired(&self) -> Result<usize, LayerError> {
        Ok(0)
    }
}
