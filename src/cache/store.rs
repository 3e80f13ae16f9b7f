//! In-process LRU layer.
//!
//! Reference implementation of [`CacheLayer`]: bounded LRU storage with lazy TTL
//! expiry on read, a background sweep hook, a tag index, and an optional
//! read-only mode for edge-style layers seeded out of band.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::config::LayerConfig;
use super::entry::{CacheEntry, CacheValue, SetOptions};
use super::error::LayerError;
use super::layer::{CacheLayer, LayerCapabilities, LayerMetrics};
use crate::context::{Clock, SystemClock};
use crate::lock::{rw_read, rw_write};
use crate::pattern::KeyPattern;

const SOURCE: &str = "cache::store";
const METRIC_LAYER_HIT: &str = "tiercache_layer_hit_total";
const METRIC_LAYER_MISS: &str = "tiercache_layer_miss_total";
const METRIC_LAYER_EVICT: &str = "tiercache_layer_evict_total";
const METRIC_LAYER_EXPIRED: &str = "tiercache_layer_expired_total";

struct StoreState {
    entries: LruCache<String, CacheEntry>,
    by_tag: HashMap<String, HashSet<String>>,
    size_bytes: usize,
}

impl StoreState {
    fn index(&mut self, entry: &CacheEntry) {
        self.size_bytes += entry.size_bytes;
        for tag in &entry.tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
    }

    fn unindex(&mut self, entry: &CacheEntry) {
        self.size_bytes = self.size_bytes.saturating_sub(entry.size_bytes);
        for tag in &entry.tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(&entry.key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(entry) => {
                self.unindex(&entry);
                true
            }
            None => false,
        }
    }

    fn reset(&mut self) {
        self.entries.clear();
        self.by_tag.clear();
        self.size_bytes = 0;
    }
}

#[derive(Default)]
struct StoreCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded in-memory cache layer.
pub struct MemoryLayer {
    config: LayerConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<StoreState>,
    counters: StoreCounters,
}

impl MemoryLayer {
    /// Create a layer on the system clock.
    pub fn new(config: LayerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LayerConfig, clock: Arc<dyn Clock>) -> Self {
        let entries = LruCache::new(config.max_entries_non_zero());
        Self {
            config,
            clock,
            state: RwLock::new(StoreState {
                entries,
                by_tag: HashMap::new(),
                size_bytes: 0,
            }),
            counters: StoreCounters::default(),
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Insert bypassing the read-only guard. Used to seed edge layers.
    pub fn preload(&self, key: &str, value: CacheValue, options: &SetOptions) {
        self.insert(key, value, options);
    }

    /// Keys currently stored, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        rw_read(&self.state, SOURCE, "keys")
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn insert(&self, key: &str, value: CacheValue, options: &SetOptions) {
        let entry = CacheEntry::new(
            key,
            value,
            options,
            self.config.default_ttl_seconds,
            self.clock.now(),
        );

        let mut state = rw_write(&self.state, SOURCE, "set");
        if let Some(previous) = state.entries.pop(key) {
            state.unindex(&previous);
        }
        state.index(&entry);
        if let Some((evicted_key, evicted)) = state.entries.push(key.to_string(), entry) {
            state.unindex(&evicted);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_LAYER_EVICT, "layer" => self.config.name.clone()).increment(1);
            debug!(layer = %self.config.name, key = %evicted_key, "Evicted under capacity pressure");
        }
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
    }

    fn ensure_writable(&self) -> Result<(), LayerError> {
        if self.config.read_only {
            return Err(LayerError::ReadOnly {
                layer: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn record_expired(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.counters
            .expirations
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!(METRIC_LAYER_EXPIRED, "layer" => self.config.name.clone()).increment(count as u64);
    }

    fn remove_matching(&self, keys: Vec<String>) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "remove_matching");
        let removed = keys.iter().filter(|key| state.remove(key)).count();
        self.counters
            .deletes
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }
}

#[async_trait]
impl CacheLayer for MemoryLayer {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capabilities(&self) -> LayerCapabilities {
        LayerCapabilities {
            read_only: self.config.read_only,
            tag_invalidation: true,
            pattern_invalidation: true,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, LayerError> {
        let now = self.clock.now();
        let mut state = rw_write(&self.state, SOURCE, "get");

        let expired = match state.entries.get_mut(key) {
            None => None,
            Some(entry) if entry.is_expired(now) => Some(true),
            Some(entry) => {
                entry.touch(now);
                Some(false)
            }
        };

        match expired {
            Some(false) => {
                let entry = state.entries.peek(key).cloned();
                drop(state);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_LAYER_HIT, "layer" => self.config.name.clone()).increment(1);
                Ok(entry)
            }
            Some(true) => {
                state.remove(key);
                drop(state);
                self.record_expired(1);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_LAYER_MISS, "layer" => self.config.name.clone()).increment(1);
                Ok(None)
            }
            None => {
                drop(state);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_LAYER_MISS, "layer" => self.config.name.clone()).increment(1);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: CacheValue,
        options: &SetOptions,
    ) -> Result<(), LayerError> {
        self.ensure_writable()?;
        self.insert(key, value, options);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, LayerError> {
        self.ensure_writable()?;
        let removed = rw_write(&self.state, SOURCE, "delete").remove(key);
        if removed {
            self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), LayerError> {
        self.ensure_writable()?;
        rw_write(&self.state, SOURCE, "clear").reset();
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, LayerError> {
        let now = self.clock.now();
        Ok(rw_read(&self.state, SOURCE, "has")
            .entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn size(&self) -> Result<usize, LayerError> {
        Ok(rw_read(&self.state, SOURCE, "size").entries.len())
    }

    fn metrics(&self) -> LayerMetrics {
        let state = rw_read(&self.state, SOURCE, "metrics");
        LayerMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: state.entries.len(),
            size_bytes: state.size_bytes,
        }
    }

    async fn invalidate_by_tags(&self, tags: &[String]) -> Result<usize, LayerError> {
        self.ensure_writable()?;
        let keys: BTreeSet<String> = {
            let state = rw_read(&self.state, SOURCE, "invalidate_by_tags");
            tags.iter()
                .filter_map(|tag| state.by_tag.get(tag))
                .flatten()
                .cloned()
                .collect()
        };
        Ok(self.remove_matching(keys.into_iter().collect()))
    }

    async fn invalidate_by_pattern(&self, pattern: &KeyPattern) -> Result<usize, LayerError> {
        self.ensure_writable()?;
        let keys: Vec<String> = rw_read(&self.state, SOURCE, "invalidate_by_pattern")
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(self.remove_matching(keys))
    }

    async fn sweep_expired(&self) -> Result<usize, LayerError> {
        let now = self.clock.now();
        let mut state = rw_write(&self.state, SOURCE, "sweep_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        drop(state);
        self.record_expired(expired.len());
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::json;
    use time::Duration;
    use time::macros::datetime;

    use super::*;
    use crate::context::ManualClock;

    fn layer_with_clock(config: LayerConfig) -> (MemoryLayer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
        (MemoryLayer::with_clock(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn huge_ttls_are_readable_and_kept() {
        let (layer, clock) = layer_with_clock(LayerConfig::default());
        for (key, ttl) in [("big", 1_000_000_000_000), ("max", u64::MAX)] {
            layer
                .set(key, json!(key), &SetOptions::default().with_ttl(ttl))
                .await
                .expect("set");
        }

        clock.advance(Duration::days(3650));
        assert_eq!(layer.sweep_expired().await.expect("sweep"), 0);
        for key in ["big", "max"] {
            let entry = layer.get(key).await.expect("get").expect("present");
            assert_eq!(entry.value, json!(key));
        }
    }

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let layer = MemoryLayer::new(LayerConfig::default());

        assert!(layer.get("a").await.expect("get").is_none());
        layer
            .set("a", json!({"v": 1}), &SetOptions::default())
            .await
            .expect("set");

        let entry = layer.get("a").await.expect("get").expect("hit");
        assert_eq!(entry.value, json!({"v": 1}));
        assert_eq!(entry.access_count, 1);

        assert!(layer.delete("a").await.expect("delete"));
        assert!(!layer.delete("a").await.expect("delete"));
        assert!(layer.get("a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_removed_on_read() {
        let (layer, clock) = layer_with_clock(LayerConfig::default());
        layer
            .set("a", json!(1), &SetOptions::default().with_ttl(5))
            .await
            .expect("set");

        clock.advance(Duration::seconds(6));

        assert!(layer.get("a").await.expect("get").is_none());
        assert_eq!(layer.size().await.expect("size"), 0);
        assert!(layer.get("a").await.expect("get").is_none());
        assert_eq!(layer.metrics().expirations, 1);
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let (layer, clock) = layer_with_clock(LayerConfig::default());
        let opts = SetOptions::default();
        layer.set("short", json!(1), &opts.clone().with_ttl(1)).await.expect("set");
        layer.set("long", json!(2), &opts.with_ttl(100)).await.expect("set");

        clock.advance(Duration::seconds(2));

        assert_eq!(layer.sweep_expired().await.expect("sweep"), 1);
        assert_eq!(layer.keys(), vec!["long".to_string()]);
    }

    #[tokio::test]
    async fn lru_eviction_cleans_tag_index() {
        let layer = MemoryLayer::new(LayerConfig {
            max_entries: 2,
            ..Default::default()
        });
        let tagged = SetOptions::default().with_tag("hero");

        layer.set("a", json!(1), &tagged).await.expect("set");
        layer.set("b", json!(2), &tagged).await.expect("set");
        layer.set("c", json!(3), &tagged).await.expect("set");

        assert!(layer.get("a").await.expect("get").is_none());
        assert_eq!(layer.metrics().evictions, 1);

        let removed = layer
            .invalidate_by_tags(&["hero".to_string()])
            .await
            .expect("tags");
        assert_eq!(removed, 2);
        assert_eq!(layer.metrics().size_bytes, 0);
    }

    #[tokio::test]
    async fn overwrite_is_not_an_eviction() {
        let layer = MemoryLayer::new(LayerConfig::default());
        layer.set("a", json!(1), &SetOptions::default()).await.expect("set");
        layer.set("a", json!(22), &SetOptions::default()).await.expect("set");

        let metrics = layer.metrics();
        assert_eq!(metrics.evictions, 0);
        assert_eq!(metrics.entries, 1);
        assert_eq!(metrics.size_bytes, 2);
    }

    #[tokio::test]
    async fn pattern_invalidation_matches_keys() {
        let layer = MemoryLayer::new(LayerConfig::default());
        for key in ["page:home", "page:about", "content:hero"] {
            layer.set(key, json!(key), &SetOptions::default()).await.expect("set");
        }

        let pattern = KeyPattern::parse("page:").expect("pattern");
        assert_eq!(layer.invalidate_by_pattern(&pattern).await.expect("pattern"), 2);
        assert_eq!(layer.keys(), vec!["content:hero".to_string()]);
    }

    #[tokio::test]
    async fn read_only_layer_rejects_writes_but_accepts_preload() {
        let layer = MemoryLayer::new(LayerConfig {
            name: "edge".to_string(),
            read_only: true,
            ..Default::default()
        });

        let err = layer
            .set("a", json!(1), &SetOptions::default())
            .await
            .expect_err("read-only");
        assert!(matches!(err, LayerError::ReadOnly { .. }));

        layer.preload("a", json!(1), &SetOptions::default());
        assert!(layer.has("a").await.expect("has"));
        assert!(layer.capabilities().read_only);
    }

    #[tokio::test]
    async fn store_recovers_from_poisoned_lock() {
        let layer = MemoryLayer::new(LayerConfig::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = layer.state.write().expect("state lock should be acquired");
            panic!("poison state lock");
        }));

        layer.set("a", json!(1), &SetOptions::default()).await.expect("set");
        assert!(layer.has("a").await.expect("has"));
    }
}
