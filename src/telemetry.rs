use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};
use crate::error::AppError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), AppError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| AppError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

/// Register units and help text for every metric the crate emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tiercache_layer_hit_total",
            Unit::Count,
            "Total number of hits, labelled by layer."
        );
        describe_counter!(
            "tiercache_layer_miss_total",
            Unit::Count,
            "Total number of misses, labelled by layer."
        );
        describe_counter!(
            "tiercache_layer_evict_total",
            Unit::Count,
            "Total number of entries evicted due to layer capacity."
        );
        describe_counter!(
            "tiercache_layer_expired_total",
            Unit::Count,
            "Total number of entries removed after their TTL elapsed."
        );
        describe_counter!(
            "tiercache_layer_error_total",
            Unit::Count,
            "Total number of layer failures absorbed by the orchestrator."
        );
        describe_counter!(
            "tiercache_backfill_total",
            Unit::Count,
            "Total number of write-through-up back-fills into faster layers."
        );
        describe_gauge!(
            "tiercache_event_queue_len",
            Unit::Count,
            "Current number of pending events, labelled by queue."
        );
        describe_counter!(
            "tiercache_event_dropped_total",
            Unit::Count,
            "Total number of events dropped due to queue overflow."
        );
        describe_histogram!(
            "tiercache_consume_ms",
            Unit::Milliseconds,
            "Intent and warming consumption latency in milliseconds."
        );
        describe_counter!(
            "tiercache_invalidation_total",
            Unit::Count,
            "Total number of processed invalidation events, labelled by type."
        );
        describe_counter!(
            "tiercache_invalidation_failed_total",
            Unit::Count,
            "Total number of invalidation events that could not be processed."
        );
        describe_counter!(
            "tiercache_invalidation_derived_total",
            Unit::Count,
            "Total number of events derived from dependency propagation."
        );
        describe_counter!(
            "tiercache_warming_target_total",
            Unit::Count,
            "Total number of warming targets processed, labelled by outcome."
        );
        describe_histogram!(
            "tiercache_warming_session_ms",
            Unit::Milliseconds,
            "Warming session duration in milliseconds."
        );
    });
}
