//! Multi-layer read/write routing.
//!
//! Layers are ordered fastest first. Reads stop at the first hit and back-fill
//! the faster layers above it. Writes, deletes, and invalidations fan out to
//! every eligible layer concurrently and report per-layer outcomes; one failing
//! backend never blocks or aborts the others.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use metrics::counter;
use serde_json::Map;
use tracing::{debug, info, warn};

use super::config::OrchestratorConfig;
use super::entry::{CacheEntry, CacheValue, SetOptions};
use super::error::{LayerError, OrchestratorError};
use super::layer::{CacheLayer, LayerCapabilities, LayerMetrics};
use super::metrics::{MetricsSnapshot, OrchestratorMetrics};
use crate::context::CacheContext;
use crate::events::{CacheEvent, InvalidatedScope};
use crate::pattern::KeyPattern;

const METRIC_LAYER_ERROR: &str = "tiercache_layer_error_total";
const METRIC_BACKFILL: &str = "tiercache_backfill_total";

/// Result of one layer's part in a fan-out.
#[derive(Debug, Clone)]
pub struct LayerOutcome {
    pub layer: String,
    /// Number of entries affected on success.
    pub result: Result<usize, LayerError>,
}

/// Per-layer summary of a fan-out operation.
#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub operation: &'static str,
    pub outcomes: Vec<LayerOutcome>,
    /// Layers not eligible for this operation (read-only or missing capability).
    pub skipped: Vec<String>,
}

impl FanOutReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &LayerError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    /// Total entries affected across layers.
    pub fn affected(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    /// True if any layer confirmed a removal.
    pub fn removed(&self) -> bool {
        self.affected() > 0
    }
}

struct RegisteredLayer {
    layer: Arc<dyn CacheLayer>,
    capabilities: LayerCapabilities,
}

/// Routes cache traffic across an ordered set of layers.
pub struct CacheOrchestrator {
    context: CacheContext,
    config: OrchestratorConfig,
    layers: Vec<RegisteredLayer>,
    metrics: OrchestratorMetrics,
}

impl CacheOrchestrator {
    /// Register `layers` fastest first. Capabilities are resolved here, once.
    pub fn new(
        context: CacheContext,
        config: OrchestratorConfig,
        layers: Vec<Arc<dyn CacheLayer>>,
    ) -> Result<Self, OrchestratorError> {
        if layers.is_empty() {
            return Err(OrchestratorError::NoLayers);
        }

        let mut names = HashSet::new();
        let mut registered = Vec::with_capacity(layers.len());
        for layer in layers {
            if !names.insert(layer.name().to_string()) {
                return Err(OrchestratorError::DuplicateLayer(layer.name().to_string()));
            }
            let capabilities = layer.capabilities();
            info!(
                layer = layer.name(),
                read_only = capabilities.read_only,
                tag_invalidation = capabilities.tag_invalidation,
                pattern_invalidation = capabilities.pattern_invalidation,
                "Cache layer registered"
            );
            registered.push(RegisteredLayer {
                layer,
                capabilities,
            });
        }

        Ok(Self {
            context,
            config,
            layers: registered,
            metrics: OrchestratorMetrics::default(),
        })
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    /// Read through the layers in order. Never fails; layer errors count as misses.
    ///
    /// A hit is written into every faster layer. By default that back-fill is awaited
    /// before returning, so a following read from a faster layer sees the value. With
    /// [`OrchestratorConfig::detached_backfill`] it is spawned onto the current tokio
    /// runtime and `get` returns as soon as the value is found.
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let started = Instant::now();
        for (idx, registered) in self.layers.iter().enumerate() {
            let layer = &registered.layer;
            match layer.get(key).await {
                Ok(Some(entry)) => {
                    let response_time_ms = elapsed_ms(started);
                    self.metrics.record_get(true, response_time_ms);
                    self.context.emit(CacheEvent::Hit {
                        layer: layer.name().to_string(),
                        key: key.to_string(),
                        response_time_ms,
                    });
                    if idx > 0 {
                        self.backfill(idx, &entry).await;
                    }
                    return Some(entry.value);
                }
                Ok(None) => {}
                Err(err) => self.absorb(layer.name(), "get", &err),
            }
        }

        let response_time_ms = elapsed_ms(started);
        self.metrics.record_get(false, response_time_ms);
        self.context.emit(CacheEvent::Miss {
            key: key.to_string(),
            response_time_ms,
        });
        None
    }

    /// Write to every mutable layer. Fails only when no mutable layer accepted the write.
    pub async fn set(
        &self,
        key: &str,
        value: CacheValue,
        mut options: SetOptions,
    ) -> Result<FanOutReport, OrchestratorError> {
        let started = Instant::now();
        if options.version.is_none() {
            let tags: Vec<String> = options.tags.iter().cloned().collect();
            let version =
                self.context
                    .versions()
                    .create(&value, &tags, Map::new(), self.context.now());
            options.version = Some(version.version);
        }

        let (writable, skipped) = self.partition(|caps| !caps.read_only);
        if writable.is_empty() {
            return Err(OrchestratorError::NoWritableLayer {
                key: key.to_string(),
            });
        }

        let outcomes = write_all(&writable, key, &value, &options).await;
        let report = FanOutReport {
            operation: "set",
            outcomes,
            skipped,
        };
        self.log_failures(&report);
        self.metrics.record_set(elapsed_ms(started));

        if report.succeeded() == 0 {
            return Err(OrchestratorError::AllLayersRejected {
                key: key.to_string(),
                failures: report.failures().cloned().collect(),
            });
        }

        debug!(
            key,
            version = options.version.as_deref().unwrap_or_default(),
            layers_ok = report.succeeded(),
            layers_failed = report.failed(),
            "Cache entry written"
        );
        self.context.emit(CacheEvent::Set {
            key: key.to_string(),
            value,
            options,
        });
        Ok(report)
    }

    /// Remove `key` from every mutable layer. `report.removed()` tells whether any layer had it.
    pub async fn delete(&self, key: &str) -> FanOutReport {
        let started = Instant::now();
        let report = self
            .fan_out(
                "delete",
                |caps| !caps.read_only,
                |layer| async move { layer.delete(key).await.map(usize::from) },
            )
            .await;
        self.metrics.record_delete(elapsed_ms(started));
        self.context.emit(CacheEvent::Deleted {
            key: key.to_string(),
            removed: report.removed(),
        });
        report
    }

    /// Flush every mutable layer.
    pub async fn clear(&self) -> FanOutReport {
        let report = self
            .fan_out(
                "clear",
                |caps| !caps.read_only,
                |layer| async move { layer.clear().await.map(|()| 0) },
            )
            .await;
        info!(
            layers_ok = report.succeeded(),
            layers_failed = report.failed(),
            "Cache layers cleared"
        );
        self.context.emit(CacheEvent::Cleared);
        report
    }

    /// Delegate to layers registered with tag-invalidation support; others are skipped.
    pub async fn invalidate_by_tags(&self, tags: &[String]) -> FanOutReport {
        let report = self
            .fan_out(
                "invalidate_by_tags",
                |caps| caps.tag_invalidation && !caps.read_only,
                |layer| async move { layer.invalidate_by_tags(tags).await },
            )
            .await;
        self.context
            .emit(CacheEvent::Invalidated(InvalidatedScope::Tags(tags.to_vec())));
        report
    }

    /// Delegate to layers registered with pattern-invalidation support; others are skipped.
    pub async fn invalidate_by_pattern(&self, pattern: &KeyPattern) -> FanOutReport {
        let report = self
            .fan_out(
                "invalidate_by_pattern",
                |caps| caps.pattern_invalidation && !caps.read_only,
                |layer| async move { layer.invalidate_by_pattern(pattern).await },
            )
            .await;
        self.context
            .emit(CacheEvent::Invalidated(InvalidatedScope::Patterns(vec![
                pattern.to_string(),
            ])));
        report
    }

    /// True if any layer holds a live entry for `key`.
    pub async fn has(&self, key: &str) -> bool {
        for registered in &self.layers {
            match registered.layer.has(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(err) => self.absorb(registered.layer.name(), "has", &err),
            }
        }
        false
    }

    /// Look up a registered layer by name.
    pub fn layer(&self, name: &str) -> Result<&Arc<dyn CacheLayer>, OrchestratorError> {
        self.layers
            .iter()
            .map(|registered| &registered.layer)
            .find(|layer| layer.name() == name)
            .ok_or_else(|| OrchestratorError::UnknownLayer(name.to_string()))
    }

    /// Read one layer directly, bypassing the read path and back-fill.
    pub async fn get_from_layer(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<CacheValue>, OrchestratorError> {
        let layer = self.layer(name)?;
        match layer.get(key).await {
            Ok(entry) => Ok(entry.map(|entry| entry.value)),
            Err(err) => {
                self.absorb(name, "get", &err);
                Ok(None)
            }
        }
    }

    pub fn capabilities(&self, name: &str) -> Result<LayerCapabilities, OrchestratorError> {
        self.layers
            .iter()
            .find(|registered| registered.layer.name() == name)
            .map(|registered| registered.capabilities)
            .ok_or_else(|| OrchestratorError::UnknownLayer(name.to_string()))
    }

    /// Layers in read order.
    pub fn layers(&self) -> impl Iterator<Item = &Arc<dyn CacheLayer>> {
        self.layers.iter().map(|registered| &registered.layer)
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers().map(|layer| layer.name().to_string()).collect()
    }

    /// Entry count per layer; a failing layer reports `None`.
    pub async fn layer_sizes(&self) -> Vec<(String, Option<usize>)> {
        let sizes = self.layers.iter().map(|registered| async move {
            let layer = &registered.layer;
            let size = match layer.size().await {
                Ok(size) => Some(size),
                Err(err) => {
                    self.absorb(layer.name(), "size", &err);
                    None
                }
            };
            (layer.name().to_string(), size)
        });
        join_all(sizes).await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn layer_metrics(&self) -> Vec<(String, LayerMetrics)> {
        self.layers()
            .map(|layer| (layer.name().to_string(), layer.metrics()))
            .collect()
    }

    /// Write `entry` into every mutable layer faster than `hit_index`.
    async fn backfill(&self, hit_index: usize, entry: &CacheEntry) {
        let targets: Vec<Arc<dyn CacheLayer>> = self.layers[..hit_index]
            .iter()
            .filter(|registered| !registered.capabilities.read_only)
            .map(|registered| Arc::clone(&registered.layer))
            .collect();
        if targets.is_empty() {
            return;
        }

        let key = entry.key.clone();
        let value = entry.value.clone();
        let options = entry.carry_options(self.context.now());
        let task = async move {
            for outcome in write_all(&targets, &key, &value, &options).await {
                match outcome.result {
                    Ok(_) => {
                        counter!(METRIC_BACKFILL, "layer" => outcome.layer.clone()).increment(1);
                        debug!(layer = %outcome.layer, key = %key, "Write-through-up back-fill");
                    }
                    Err(err) => warn!(
                        layer = %outcome.layer,
                        key = %key,
                        error = %err,
                        "Write-through-up back-fill failed"
                    ),
                }
            }
        };

        if self.config.detached_backfill
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(task);
            return;
        }
        task.await;
    }

    fn partition(
        &self,
        eligible: impl Fn(&LayerCapabilities) -> bool,
    ) -> (Vec<Arc<dyn CacheLayer>>, Vec<String>) {
        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        for registered in &self.layers {
            if eligible(&registered.capabilities) {
                selected.push(Arc::clone(&registered.layer));
            } else {
                skipped.push(registered.layer.name().to_string());
            }
        }
        (selected, skipped)
    }

    async fn fan_out<'a, F, Fut>(
        &'a self,
        operation: &'static str,
        eligible: impl Fn(&LayerCapabilities) -> bool,
        call: F,
    ) -> FanOutReport
    where
        F: Fn(&'a Arc<dyn CacheLayer>) -> Fut,
        Fut: Future<Output = Result<usize, LayerError>> + 'a,
    {
        let mut skipped = Vec::new();
        let mut calls = Vec::new();
        for registered in &self.layers {
            if !eligible(&registered.capabilities) {
                skipped.push(registered.layer.name().to_string());
                continue;
            }
            let layer = &registered.layer;
            let pending = call(layer);
            calls.push(async move {
                LayerOutcome {
                    layer: layer.name().to_string(),
                    result: pending.await,
                }
            });
        }

        let report = FanOutReport {
            operation,
            outcomes: join_all(calls).await,
            skipped,
        };
        self.log_failures(&report);
        report
    }

    fn log_failures(&self, report: &FanOutReport) {
        for outcome in &report.outcomes {
            if let Err(err) = &outcome.result {
                self.absorb(&outcome.layer, report.operation, err);
            }
        }
    }

    fn absorb(&self, layer: &str, op: &'static str, err: &LayerError) {
        self.metrics.record_layer_errors(1);
        counter!(METRIC_LAYER_ERROR, "layer" => layer.to_string(), "op" => op).increment(1);
        warn!(layer, op, error = %err, "Cache layer call failed, continuing with remaining layers");
    }
}

async fn write_all(
    layers: &[Arc<dyn CacheLayer>],
    key: &str,
    value: &CacheValue,
    options: &SetOptions,
) -> Vec<LayerOutcome> {
    let writes = layers.iter().map(|layer| async move {
        LayerOutcome {
            layer: layer.name().to_string(),
            result: layer.set(key, value.clone(), options).await.map(|()| 1),
        }
    });
    join_all(writes).await
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cache::config::LayerConfig;
    use crate::cache::store::MemoryLayer;

    /// Layer whose every call fails.
    struct DownLayer;

    #[async_trait]
    impl CacheLayer for DownLayer {
        fn name(&self) -> &str {
            "down"
        }

        fn capabilities(&self) -> LayerCapabilities {
            LayerCapabilities {
                tag_invalidation: true,
                ..Default::default()
            }
        }

        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        async fn set(
            &self,
            _key: &str,
            _value: CacheValue,
            _options: &SetOptions,
        ) -> Result<(), LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        async fn delete(&self, _key: &str) -> Result<bool, LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        async fn clear(&self) -> Result<(), LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        async fn has(&self, _key: &str) -> Result<bool, LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        async fn size(&self) -> Result<usize, LayerError> {
            Err(LayerError::unavailable("down", "connection refused"))
        }

        fn metrics(&self) -> LayerMetrics {
            LayerMetrics::default()
        }
    }

    fn memory(name: &str) -> Arc<MemoryLayer> {
        Arc::new(MemoryLayer::new(LayerConfig::named(name)))
    }

    fn orchestrator(layers: Vec<Arc<dyn CacheLayer>>) -> CacheOrchestrator {
        CacheOrchestrator::new(CacheContext::default(), OrchestratorConfig::default(), layers)
            .expect("orchestrator builds")
    }

    #[test]
    fn zero_layers_is_a_configuration_error() {
        let err = CacheOrchestrator::new(
            CacheContext::default(),
            OrchestratorConfig::default(),
            Vec::new(),
        )
        .err()
        .expect("no layers");
        assert!(matches!(err, OrchestratorError::NoLayers));
    }

    #[test]
    fn duplicate_layer_names_are_rejected() {
        let err = CacheOrchestrator::new(
            CacheContext::default(),
            OrchestratorConfig::default(),
            vec![memory("memory"), memory("memory")],
        )
        .err()
        .expect("duplicate");
        assert!(matches!(err, OrchestratorError::DuplicateLayer(name) if name == "memory"));
    }

    #[tokio::test]
    async fn set_then_get_returns_value_and_generates_version() {
        let orchestrator = orchestrator(vec![memory("memory")]);
        let report = orchestrator
            .set("a", json!("v1"), SetOptions::default())
            .await
            .expect("set");
        assert_eq!(report.succeeded(), 1);

        assert_eq!(orchestrator.get("a").await, Some(json!("v1")));

        let entry = orchestrator
            .layer("memory")
            .expect("layer")
            .get("a")
            .await
            .expect("get")
            .expect("hit");
        assert!(entry.version.is_some());
    }

    #[tokio::test]
    async fn failing_layer_does_not_block_writes_or_reads() {
        let orchestrator = orchestrator(vec![Arc::new(DownLayer), memory("memory")]);

        let report = orchestrator
            .set("a", json!(1), SetOptions::default())
            .await
            .expect("one layer accepted");
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);

        assert_eq!(orchestrator.get("a").await, Some(json!(1)));
        assert!(orchestrator.metrics().layer_errors >= 2);
    }

    #[tokio::test]
    async fn set_fails_only_when_every_mutable_layer_rejects() {
        let orchestrator = orchestrator(vec![Arc::new(DownLayer)]);
        let err = orchestrator
            .set("a", json!(1), SetOptions::default())
            .await
            .expect_err("all rejected");
        assert!(matches!(err, OrchestratorError::AllLayersRejected { failures, .. } if failures.len() == 1));
    }

    #[tokio::test]
    async fn read_only_layers_are_skipped_on_write() {
        let edge = Arc::new(MemoryLayer::new(LayerConfig {
            name: "edge".to_string(),
            read_only: true,
            ..Default::default()
        }));
        let orchestrator = orchestrator(vec![memory("memory"), edge.clone()]);

        let report = orchestrator
            .set("a", json!(1), SetOptions::default())
            .await
            .expect("set");
        assert_eq!(report.skipped, vec!["edge".to_string()]);
        assert_eq!(edge.metrics().sets, 0);

        let err = CacheOrchestrator::new(
            CacheContext::default(),
            OrchestratorConfig::default(),
            vec![edge],
        )
        .expect("builds")
        .set("a", json!(1), SetOptions::default())
        .await
        .expect_err("no writable layer");
        assert!(matches!(err, OrchestratorError::NoWritableLayer { .. }));
    }

    #[tokio::test]
    async fn hit_in_slow_layer_back_fills_faster_layers() {
        let fast = memory("memory");
        let slow = memory("remote");
        slow.set("a", json!("v1"), &SetOptions::default())
            .await
            .expect("seed");
        let orchestrator = orchestrator(vec![fast.clone(), slow]);

        assert_eq!(orchestrator.get("a").await, Some(json!("v1")));
        assert_eq!(
            orchestrator
                .get_from_layer("memory", "a")
                .await
                .expect("known layer"),
            Some(json!("v1"))
        );
    }

    #[tokio::test]
    async fn delete_reports_confirmed_removal() {
        let orchestrator = orchestrator(vec![memory("memory"), memory("remote")]);
        orchestrator
            .set("a", json!(1), SetOptions::default())
            .await
            .expect("set");

        let report = orchestrator.delete("a").await;
        assert!(report.removed());
        assert_eq!(report.affected(), 2);
        assert!(!orchestrator.delete("a").await.removed());
        assert_eq!(orchestrator.get("a").await, None);
    }

    #[tokio::test]
    async fn tag_invalidation_only_reaches_capable_layers() {
        let orchestrator = orchestrator(vec![memory("memory"), Arc::new(DownLayer)]);
        orchestrator
            .set("a", json!(1), SetOptions::default().with_tag("hero"))
            .await
            .expect("set");

        let report = orchestrator.invalidate_by_tags(&["hero".to_string()]).await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.affected(), 1);
        assert!(!orchestrator.has("a").await);
    }

    #[tokio::test]
    async fn unknown_layer_is_reported() {
        let orchestrator = orchestrator(vec![memory("memory")]);
        let err = orchestrator
            .get_from_layer("cdn", "a")
            .await
            .expect_err("unknown");
        assert!(matches!(err, OrchestratorError::UnknownLayer(name) if name == "cdn"));
    }

    #[tokio::test]
    async fn get_emits_hit_and_miss_events() {
        let orchestrator = orchestrator(vec![memory("memory")]);
        orchestrator.get("missing").await;
        orchestrator
            .set("a", json!(1), SetOptions::default())
            .await
            .expect("set");
        orchestrator.get("a").await;

        let kinds: Vec<&str> = orchestrator
            .context()
            .events()
            .snapshot()
            .iter()
            .map(CacheEvent::kind)
            .collect();
        assert_eq!(kinds, vec!["miss", "set", "hit"]);

        let metrics = orchestrator.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 0.5).abs() < 1e-9);
    }
}
