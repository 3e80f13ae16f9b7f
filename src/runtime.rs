//! Wiring facade.
//!
//! [`CacheRuntime`] builds the shared [`CacheContext`] once and hands it to the
//! orchestrator, the invalidation coordinator, and the warming scheduler. The
//! three only talk to each other through queues; the runtime's intent consumer
//! is what applies their output to the cache layers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Map;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{
    CacheLayer, CacheOrchestrator, CacheValue, FanOutReport, IntentConsumer, LayerConfig,
    MemoryLayer, OrchestratorConfig, OrchestratorError, SetOptions,
};
use crate::config::Settings;
use crate::context::CacheContext;
use crate::events::EventQueue;
use crate::invalidation::{
    InvalidationCoordinator, InvalidationError, InvalidationEvent, InvalidationOutcome,
    InvalidationRule, PropagationConfig,
};
use crate::warming::{
    WarmingConfig, WarmingContext, WarmingError, WarmingRequest, WarmingScheduler,
    WarmingSession,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Invalidation(#[from] InvalidationError),
    #[error(transparent)]
    Warming(#[from] WarmingError),
}

/// Component configuration for a runtime built from explicit layers.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub orchestrator: OrchestratorConfig,
    pub propagation: PropagationConfig,
    pub warming: WarmingConfig,
    /// Per-layer TTL sweep period. Layers not listed use the default layer interval.
    pub sweep_intervals: HashMap<String, Duration>,
}

impl From<&Settings> for RuntimeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            orchestrator: OrchestratorConfig::from(&settings.orchestrator),
            propagation: PropagationConfig::from(&settings.propagation),
            warming: WarmingConfig::from(&settings.warming),
            sweep_intervals: settings
                .layers
                .iter()
                .map(|layer| (layer.name.clone(), layer.sweep_interval))
                .collect(),
        }
    }
}

/// Result of [`CacheRuntime::set_and_invalidate`].
#[derive(Debug)]
pub struct WriteOutcome {
    pub version: String,
    pub write: FanOutReport,
    pub invalidation: InvalidationOutcome,
    /// Intents applied before the new value was written.
    pub intents_applied: usize,
}

pub struct CacheRuntime {
    context: CacheContext,
    config: RuntimeConfig,
    orchestrator: Arc<CacheOrchestrator>,
    coordinator: Arc<InvalidationCoordinator>,
    scheduler: Arc<WarmingScheduler>,
    consumer: Arc<IntentConsumer>,
}

impl CacheRuntime {
    pub fn new(
        context: CacheContext,
        config: RuntimeConfig,
        layers: Vec<Arc<dyn CacheLayer>>,
    ) -> Result<Self, RuntimeError> {
        let intents = Arc::new(EventQueue::with_limit(
            "intents",
            config.propagation.queue_limit,
        ));
        let warming = Arc::new(EventQueue::new("warming"));

        let orchestrator = Arc::new(CacheOrchestrator::new(
            context.clone(),
            config.orchestrator.clone(),
            layers,
        )?);
        let coordinator = Arc::new(InvalidationCoordinator::new(
            context.clone(),
            config.propagation.clone(),
            Arc::clone(&intents),
        ));
        let scheduler = Arc::new(WarmingScheduler::new(
            context.clone(),
            config.warming.clone(),
            Arc::clone(&warming),
        ));
        let consumer = Arc::new(
            IntentConsumer::new(
                config.orchestrator.clone(),
                Arc::clone(&orchestrator),
                intents,
                warming,
            )
            .with_scheduler(Arc::clone(&scheduler)),
        );

        Ok(Self {
            context,
            config,
            orchestrator,
            coordinator,
            scheduler,
            consumer,
        })
    }

    /// Build memory layers and load rules from resolved settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, RuntimeError> {
        let context = CacheContext::with_strategy(settings.versioning.strategy);
        Self::from_settings_with_context(settings, context)
    }

    /// Like [`CacheRuntime::from_settings`] but with a caller-supplied context, e.g. a manual clock.
    pub fn from_settings_with_context(
        settings: &Settings,
        context: CacheContext,
    ) -> Result<Self, RuntimeError> {
        let layers = settings
            .layers
            .iter()
            .map(|layer| {
                Arc::new(MemoryLayer::with_clock(
                    LayerConfig::from(layer),
                    Arc::clone(context.clock()),
                )) as Arc<dyn CacheLayer>
            })
            .collect();

        let runtime = Self::new(context, RuntimeConfig::from(settings), layers)?;
        for rule in &settings.rules {
            runtime.coordinator.add_rule(InvalidationRule::from(rule));
        }

        info!(
            layers = runtime.orchestrator.layer_names().len(),
            rules = settings.rules.len(),
            strategy = %settings.versioning.strategy,
            "Cache runtime initialised"
        );
        Ok(runtime)
    }

    /// Read through the layers and record the access for warming.
    pub async fn get(&self, key: &str, context: &WarmingContext) -> Option<CacheValue> {
        let value = self.orchestrator.get(key).await;
        self.scheduler.record_access(key, context);
        value
    }

    pub async fn set(
        &self,
        key: &str,
        value: CacheValue,
        options: SetOptions,
    ) -> Result<FanOutReport, RuntimeError> {
        Ok(self.orchestrator.set(key, value, options).await?)
    }

    /// Invalidate `key` and everything that depends on it, then write the new value.
    ///
    /// The content-change event carries the new version and propagates through the
    /// dependency graph. Resulting intents are applied before the write so the
    /// fresh value is not removed by its own invalidation.
    pub async fn set_and_invalidate(
        &self,
        key: &str,
        value: CacheValue,
        options: SetOptions,
    ) -> Result<WriteOutcome, RuntimeError> {
        let tags: Vec<String> = options.tags.iter().cloned().collect();
        let version = self.coordinator.create_version(&value, &tags, Map::new());

        let event = InvalidationEvent::content_change("runtime:set", key)
            .with_priority(options.priority)
            .with_propagate(true)
            .with_version(version.version.clone());
        let invalidation = self.coordinator.invalidate(&event)?;
        let intents_applied = self.settle().await;

        let write = self
            .orchestrator
            .set(key, value, options.with_version(version.version.clone()))
            .await?;

        debug!(
            key,
            version = %version.version,
            intents_applied,
            derived = invalidation.derived,
            "Value written after invalidation"
        );
        Ok(WriteOutcome {
            version: version.version,
            write,
            invalidation,
            intents_applied,
        })
    }

    /// Publish an invalidation event; with `consume_now` apply its intents and
    /// propagation before returning instead of leaving them to the workers.
    pub async fn trigger(
        &self,
        event: InvalidationEvent,
        consume_now: bool,
    ) -> Result<InvalidationOutcome, RuntimeError> {
        let outcome = self.coordinator.invalidate(&event)?;
        if consume_now {
            self.settle().await;
        }
        Ok(outcome)
    }

    /// Run a warming session and write everything it produced.
    pub async fn warm(&self, request: WarmingRequest) -> Result<WarmingSession, RuntimeError> {
        let session = self.scheduler.start_warming_session(request).await?;
        let mut written = 0;
        loop {
            let batch = self.consumer.consume_warming().await;
            if batch == 0 {
                break;
            }
            written += batch;
        }
        debug!(session_id = %session.id, written, "Warming session output applied");
        Ok(session)
    }

    /// Drain propagation and intents until both queues are empty.
    ///
    /// Derived events never propagate further, so this terminates.
    pub async fn settle(&self) -> usize {
        let mut applied = 0;
        loop {
            let derived = self.coordinator.process_propagation_queue();
            let intents = self.consumer.consume_intents().await;
            applied += intents;
            if derived == 0 && intents == 0 {
                return applied;
            }
        }
    }

    pub fn sweep_interval(&self, layer: &str) -> Duration {
        self.config
            .sweep_intervals
            .get(layer)
            .copied()
            .unwrap_or_else(|| LayerConfig::default().sweep_interval())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn context(&self) -> &CacheContext {
        &self.context
    }

    pub fn orchestrator(&self) -> &Arc<CacheOrchestrator> {
        &self.orchestrator
    }

    pub fn coordinator(&self) -> &Arc<InvalidationCoordinator> {
        &self.coordinator
    }

    pub fn scheduler(&self) -> &Arc<WarmingScheduler> {
        &self.scheduler
    }

    pub fn consumer(&self) -> &Arc<IntentConsumer> {
        &self.consumer
    }
}
