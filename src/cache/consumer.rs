//! Intent consumer.
//!
//! Drains invalidation intents and warming data from their queues and applies
//! them to the orchestrator. This is the only place where invalidation and
//! warming results reach the cache layers.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::OrchestratorConfig;
use super::entry::SetOptions;
use super::orchestrator::{CacheOrchestrator, FanOutReport};
use crate::events::EventQueue;
use crate::invalidation::{IntentTarget, InvalidationIntent, RuleAction};
use crate::pattern::KeyPattern;
use crate::warming::{WarmingData, WarmingScheduler};

const METRIC_CONSUME_MS: &str = "tiercache_consume_ms";

pub struct IntentConsumer {
    config: OrchestratorConfig,
    orchestrator: Arc<CacheOrchestrator>,
    intents: Arc<EventQueue<InvalidationIntent>>,
    warming: Arc<EventQueue<WarmingData>>,
    scheduler: Option<Arc<WarmingScheduler>>,
}

impl IntentConsumer {
    pub fn new(
        config: OrchestratorConfig,
        orchestrator: Arc<CacheOrchestrator>,
        intents: Arc<EventQueue<InvalidationIntent>>,
        warming: Arc<EventQueue<WarmingData>>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            intents,
            warming,
            scheduler: None,
        }
    }

    /// Route `refresh` intents to `scheduler` so matching targets are re-warmed.
    pub fn with_scheduler(mut self, scheduler: Arc<WarmingScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Apply one batch of pending intents, then one batch of warming data.
    ///
    /// Returns true if anything was applied.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> bool {
        let started = Instant::now();
        let intents = self.consume_intents().await;
        let warmed = self.consume_warming().await;
        if intents == 0 && warmed == 0 {
            return false;
        }

        info!(intents, warmed, "Cache consumption complete");
        histogram!(METRIC_CONSUME_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        true
    }

    /// Apply up to `consume_batch_limit` intents in publication order.
    pub async fn consume_intents(&self) -> usize {
        let batch = self.intents.drain(self.config.consume_batch_limit);
        let count = batch.len();
        for envelope in batch {
            self.apply_intent(envelope.id, envelope.payload).await;
        }
        count
    }

    /// Write up to `consume_batch_limit` warmed values through the orchestrator.
    pub async fn consume_warming(&self) -> usize {
        let batch = self.warming.drain(self.config.consume_batch_limit);
        let count = batch.len();
        for envelope in batch {
            let data = envelope.payload;
            match self
                .orchestrator
                .set(&data.key, data.value, SetOptions::default())
                .await
            {
                Ok(report) => debug!(
                    key = %data.key,
                    target_id = %data.target_id,
                    session_id = %data.session_id,
                    layers_ok = report.succeeded(),
                    "Warmed value written"
                ),
                Err(err) => warn!(
                    key = %data.key,
                    target_id = %data.target_id,
                    error = %err,
                    "Warmed value rejected by every layer"
                ),
            }
        }
        count
    }

    async fn apply_intent(&self, envelope_id: Uuid, intent: InvalidationIntent) {
        // `mark_stale` removes like `delete`.
        let report = self.remove(&intent.target).await;
        debug!(
            envelope_id = %envelope_id,
            event_id = %intent.event_id,
            target = %intent.target,
            action = %intent.action,
            origin = ?intent.origin,
            affected = report.affected(),
            layers_failed = report.failed(),
            "Invalidation intent applied"
        );

        if intent.action == RuleAction::Refresh
            && let Some(scheduler) = &self.scheduler
        {
            let pattern = match &intent.target {
                IntentTarget::Key(key) => Some(KeyPattern::contains(key.as_str())),
                IntentTarget::Pattern(pattern) => Some(pattern.clone()),
                IntentTarget::Global => Some(KeyPattern::contains("")),
                IntentTarget::Tags(_) => None,
            };
            if let Some(pattern) = pattern {
                scheduler.queue_refresh(&pattern);
            }
        }
    }

    async fn remove(&self, target: &IntentTarget) -> FanOutReport {
        match target {
            IntentTarget::Key(key) => self.orchestrator.delete(key).await,
            IntentTarget::Pattern(pattern) => self.orchestrator.invalidate_by_pattern(pattern).await,
            IntentTarget::Tags(tags) => self.orchestrator.invalidate_by_tags(tags).await,
            IntentTarget::Global => self.orchestrator.clear().await,
        }
    }

    pub fn orchestrator(&self) -> &Arc<CacheOrchestrator> {
        &self.orchestrator
    }

    pub fn intents(&self) -> &Arc<EventQueue<InvalidationIntent>> {
        &self.intents
    }

    pub fn warming(&self) -> &Arc<EventQueue<WarmingData>> {
        &self.warming
    }
}
