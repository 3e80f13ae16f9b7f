use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;
use serial_test::serial;
use time::macros::datetime;
use tiercache::cache::{
    CacheEntry, CacheLayer, CacheOrchestrator, CacheValue, LayerConfig, LayerError, LayerMetrics,
    MemoryLayer, OrchestratorConfig, SetOptions,
};
use tiercache::context::{CacheContext, ManualClock};
use tiercache::events::EventQueue;
use tiercache::invalidation::{InvalidationEvent, NodeType};
use tiercache::runtime::{CacheRuntime, RuntimeConfig};
use tiercache::warming::{WarmingRequest, WarmingStrategy, WarmingTarget, fetcher_fn};

struct DownLayer;

#[async_trait]
impl CacheLayer for DownLayer {
    fn name(&self) -> &str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    async fn set(
        &self,
        _key: &str,
        _value: CacheValue,
        _options: &SetOptions,
    ) -> Result<(), LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    async fn delete(&self, _key: &str) -> Result<bool, LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    async fn clear(&self) -> Result<(), LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    async fn has(&self, _key: &str) -> Result<bool, LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    async fn size(&self) -> Result<usize, LayerError> {
        Err(LayerError::unavailable("down", "timeout"))
    }

    fn metrics(&self) -> LayerMetrics {
        LayerMetrics::default()
    }
}

#[tokio::test]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let clock = Arc::new(ManualClock::new(datetime!(2024-05-01 10:00 UTC)));
    let context = CacheContext::default().with_clock(clock.clone());
    let small: Arc<dyn CacheLayer> = Arc::new(MemoryLayer::with_clock(
        LayerConfig {
            max_entries: 1,
            ..LayerConfig::named("memory")
        },
        clock.clone(),
    ));
    let remote: Arc<dyn CacheLayer> =
        Arc::new(MemoryLayer::with_clock(LayerConfig::named("remote"), clock.clone()));
    let runtime = CacheRuntime::new(context, RuntimeConfig::default(), vec![small, remote])
        .expect("runtime");

    // Layer hit/miss/evict/back-fill
    let orchestrator = runtime.orchestrator();
    orchestrator
        .set("a", json!(1), SetOptions::default())
        .await
        .expect("set a");
    orchestrator
        .set("b", json!(2), SetOptions::default())
        .await
        .expect("set b");
    assert_eq!(orchestrator.get("a").await, Some(json!(1)));
    assert_eq!(orchestrator.get("missing").await, None);

    // Expiry
    orchestrator
        .set("short", json!("s"), SetOptions::default().with_ttl(1))
        .await
        .expect("set short");
    clock.advance(time::Duration::seconds(5));
    let swept = orchestrator
        .layer("remote")
        .expect("layer")
        .sweep_expired()
        .await
        .expect("sweep");
    assert_eq!(swept, 1);

    // Layer errors
    let degraded = CacheOrchestrator::new(
        CacheContext::default(),
        OrchestratorConfig::default(),
        vec![Arc::new(DownLayer), Arc::new(MemoryLayer::new(LayerConfig::named("memory")))],
    )
    .expect("orchestrator");
    degraded
        .set("k", json!(0), SetOptions::default())
        .await
        .expect("memory accepts");

    // Queue length and drops
    let queue = EventQueue::with_limit("scratch", 1);
    assert!(queue.publish(1_u8));
    assert!(!queue.publish(2_u8));
    let _ = queue.drain(1);

    // Invalidation, derived events, failures, consumption
    runtime
        .coordinator()
        .add_dependency("page:home", "post:1", NodeType::Component);
    runtime
        .trigger(
            InvalidationEvent::content_change("metrics", "post:1").with_propagate(true),
            false,
        )
        .await
        .expect("trigger");
    assert!(runtime.consumer().consume().await);
    assert!(
        runtime
            .trigger(
                InvalidationEvent::content_change("metrics", Vec::<String>::new()),
                false,
            )
            .await
            .is_err()
    );

    // Warming
    runtime.scheduler().add_target(WarmingTarget::new(
        "home",
        "page:home",
        fetcher_fn(|| async { Ok(json!("<html>")) }),
    ));
    let session = runtime
        .warm(WarmingRequest::new(WarmingStrategy::Queued).with_targets(["home"]))
        .await
        .expect("warm");
    assert_eq!(session.completed, 1);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "tiercache_layer_hit_total",
        "tiercache_layer_miss_total",
        "tiercache_layer_evict_total",
        "tiercache_layer_expired_total",
        "tiercache_layer_error_total",
        "tiercache_backfill_total",
        "tiercache_event_queue_len",
        "tiercache_event_dropped_total",
        "tiercache_consume_ms",
        "tiercache_invalidation_total",
        "tiercache_invalidation_failed_total",
        "tiercache_invalidation_derived_total",
        "tiercache_warming_target_total",
        "tiercache_warming_session_ms",
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }
}
