//! Turns invalidation events into intents.
//!
//! The coordinator never touches cache layers. For each event it publishes the
//! direct intent, then the cascade intents of every matching rule in priority
//! order, and finally queues one derived event per dependent discovered in the
//! dependency graph. Derived events are processed later by
//! [`InvalidationCoordinator::process_propagation_queue`].

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::PropagationConfig;
use super::error::InvalidationError;
use super::event::{
    IntentOrigin, IntentTarget, InvalidationEvent, InvalidationIntent, InvalidationScope,
    RuleAction,
};
use super::graph::{DependencyGraph, NodeType};
use super::rules::{InvalidationRule, RuleSet};
use super::version::CacheVersion;
use crate::context::CacheContext;
use crate::events::EventQueue;
use crate::lock::{rw_read, rw_write};
use crate::pattern::KeyPattern;

const SOURCE: &str = "invalidation::coordinator";
const METRIC_INVALIDATION: &str = "tiercache_invalidation_total";
const METRIC_INVALIDATION_FAILED: &str = "tiercache_invalidation_failed_total";
const METRIC_DERIVED: &str = "tiercache_invalidation_derived_total";

/// What one `invalidate` call produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub event_id: Uuid,
    /// Intents published, direct first.
    pub intents: usize,
    /// Derived events queued for propagation.
    pub derived: usize,
    /// Ids of the rules that fired, highest priority first.
    pub rules_applied: Vec<String>,
    pub cycles_tolerated: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub failed: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub processed: u64,
    pub failed: u64,
    pub derived: u64,
    pub intents: u64,
    pub cycles_tolerated: u64,
    pub pending_propagation: usize,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    derived: AtomicU64,
    intents: AtomicU64,
    cycles_tolerated: AtomicU64,
}

pub struct InvalidationCoordinator {
    context: CacheContext,
    config: PropagationConfig,
    graph: DependencyGraph,
    rules: RwLock<RuleSet>,
    intents: Arc<EventQueue<InvalidationIntent>>,
    propagation: EventQueue<InvalidationEvent>,
    counters: Counters,
}

impl InvalidationCoordinator {
    pub fn new(
        context: CacheContext,
        config: PropagationConfig,
        intents: Arc<EventQueue<InvalidationIntent>>,
    ) -> Self {
        let propagation = EventQueue::with_limit("propagation", config.queue_limit);
        Self {
            context,
            config,
            graph: DependencyGraph::new(),
            rules: RwLock::new(RuleSet::default()),
            intents,
            propagation,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn intents(&self) -> &Arc<EventQueue<InvalidationIntent>> {
        &self.intents
    }

    pub fn create_version(
        &self,
        content: &Value,
        tags: &[String],
        metadata: Map<String, Value>,
    ) -> CacheVersion {
        self.context
            .versions()
            .create(content, tags, metadata, self.context.now())
    }

    pub fn compare_versions(&self, a: &str, b: &str) -> Ordering {
        self.context.versions().compare(a, b)
    }

    /// True when `candidate` is at least `minimum` under the configured strategy.
    pub fn is_version_valid(&self, candidate: &str, minimum: &str) -> bool {
        self.context.versions().is_valid(candidate, minimum)
    }

    pub fn add_dependency(&self, node: &str, depends_on: &str, node_type: NodeType) -> bool {
        let added = self.graph.add_dependency(node, depends_on, node_type);
        if added {
            debug!(node, depends_on, "Dependency added");
        }
        added
    }

    pub fn remove_dependency(&self, node: &str, depends_on: &str) -> bool {
        self.graph.remove_dependency(node, depends_on)
    }

    pub fn remove_node(&self, id: &str) -> bool {
        self.graph.remove_node(id)
    }

    /// Insert or replace a rule by id.
    pub fn add_rule(&self, rule: InvalidationRule) {
        let id = rule.id.clone();
        let priority = rule.priority;
        let replaced = rw_write(&self.rules, SOURCE, "add_rule").insert(rule);
        info!(
            rule_id = %id,
            priority,
            replaced = replaced.is_some(),
            "Invalidation rule registered"
        );
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        rw_write(&self.rules, SOURCE, "remove_rule")
            .remove(id)
            .is_some()
    }

    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        rw_write(&self.rules, SOURCE, "set_rule_enabled").set_enabled(id, enabled)
    }

    /// Registered rules, highest priority first.
    pub fn rules(&self) -> Vec<InvalidationRule> {
        rw_read(&self.rules, SOURCE, "rules").iter().cloned().collect()
    }

    /// Publish intents for `event` and queue derived events for its dependents.
    pub fn invalidate(
        &self,
        event: &InvalidationEvent,
    ) -> Result<InvalidationOutcome, InvalidationError> {
        let result = self.invalidate_inner(event);
        match &result {
            Ok(outcome) => {
                self.counters
                    .processed
                    .fetch_add(1, AtomicOrdering::Relaxed);
                counter!(METRIC_INVALIDATION, "type" => event.kind.as_str()).increment(1);
                info!(
                    event_id = %event.id,
                    event_type = %event.kind,
                    target = %event.target,
                    scope = %event.scope,
                    intents = outcome.intents,
                    derived = outcome.derived,
                    rules = ?outcome.rules_applied,
                    "Invalidation processed"
                );
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                counter!(METRIC_INVALIDATION_FAILED, "type" => event.kind.as_str()).increment(1);
                warn!(event_id = %event.id, error = %err, "Invalidation rejected");
            }
        }
        result
    }

    fn invalidate_inner(
        &self,
        event: &InvalidationEvent,
    ) -> Result<InvalidationOutcome, InvalidationError> {
        if event.scope != InvalidationScope::Global && event.target.is_empty() {
            return Err(InvalidationError::EmptyTarget { event_id: event.id });
        }

        let mut intents = direct_intents(event)?;
        let mut rules_applied = Vec::new();
        {
            let rules = rw_read(&self.rules, SOURCE, "invalidate");
            for rule in rules.matching(event) {
                rules_applied.push(rule.id.clone());
                intents.extend(rule.cascade.iter().map(|pattern| InvalidationIntent {
                    event_id: event.id,
                    target: IntentTarget::Pattern(pattern.clone()),
                    action: rule.action,
                    origin: IntentOrigin::Rule(rule.id.clone()),
                }));
            }
        }

        let published = intents.len();
        let dropped = intents
            .into_iter()
            .map(|intent| self.intents.publish(intent))
            .filter(|accepted| !accepted)
            .count();
        self.counters
            .intents
            .fetch_add((published - dropped) as u64, AtomicOrdering::Relaxed);

        let now = self.context.now();
        for id in event.target.ids() {
            self.graph
                .mark_invalidated(id, now, event.version.as_deref());
        }

        let mut outcome = InvalidationOutcome {
            event_id: event.id,
            intents: published - dropped,
            derived: 0,
            rules_applied,
            cycles_tolerated: 0,
        };

        if event.propagate {
            let traversal = self
                .graph
                .dependents_within(event.target.ids(), self.config.max_depth);
            outcome.cycles_tolerated = traversal.cycles_tolerated;
            self.counters
                .cycles_tolerated
                .fetch_add(traversal.cycles_tolerated as u64, AtomicOrdering::Relaxed);

            for (dependent, depth) in &traversal.dependents {
                let derived = event.derived_for(dependent);
                debug!(
                    event_id = %event.id,
                    derived_id = %derived.id,
                    dependent = %dependent,
                    depth,
                    "Derived invalidation queued"
                );
                if self.propagation.publish(derived) {
                    outcome.derived += 1;
                }
            }
            self.counters
                .derived
                .fetch_add(outcome.derived as u64, AtomicOrdering::Relaxed);
            counter!(METRIC_DERIVED).increment(outcome.derived as u64);
        }

        if dropped > 0 {
            return Err(InvalidationError::QueueFull {
                queue: self.intents.name(),
                dropped,
            });
        }
        Ok(outcome)
    }

    /// Process `events` by descending priority in fixed-size batches.
    ///
    /// Failures are counted and never stop the batch.
    pub async fn invalidate_batch(&self, mut events: Vec<InvalidationEvent>) -> BatchSummary {
        // `sort_by` is stable: equal priorities keep submission order.
        events.sort_by(|a, b| b.priority.cmp(&a.priority));

        let batch_size = self.config.batch_size();
        let delay = self.config.delay();
        let mut summary = BatchSummary::default();
        let total_batches = events.len().div_ceil(batch_size);

        for (index, batch) in events.chunks(batch_size).enumerate() {
            for event in batch {
                match self.invalidate(event) {
                    Ok(_) => summary.processed += 1,
                    Err(_) => summary.failed += 1,
                }
            }
            summary.batches += 1;
            debug!(
                batch = index + 1,
                total_batches,
                size = batch.len(),
                "Invalidation batch processed"
            );
            if index + 1 < total_batches && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            batches = summary.batches,
            "Invalidation batch complete"
        );
        summary
    }

    /// Invalidate up to one batch of derived events. Returns how many were taken.
    pub fn process_propagation_queue(&self) -> usize {
        let derived = self.propagation.drain(self.config.batch_size());
        let taken = derived.len();
        for envelope in derived {
            // Errors are already counted and logged by `invalidate`.
            let _ = self.invalidate(&envelope.payload);
        }
        if taken > 0 {
            debug!(
                taken,
                remaining = self.propagation.len(),
                "Propagation queue drained"
            );
        }
        taken
    }

    pub fn pending_propagation(&self) -> usize {
        self.propagation.len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            processed: self.counters.processed.load(AtomicOrdering::Relaxed),
            failed: self.counters.failed.load(AtomicOrdering::Relaxed),
            derived: self.counters.derived.load(AtomicOrdering::Relaxed),
            intents: self.counters.intents.load(AtomicOrdering::Relaxed),
            cycles_tolerated: self.counters.cycles_tolerated.load(AtomicOrdering::Relaxed),
            pending_propagation: self.propagation.len(),
        }
    }
}

fn direct_intents(event: &InvalidationEvent) -> Result<Vec<InvalidationIntent>, InvalidationError> {
    let intent = |target| InvalidationIntent {
        event_id: event.id,
        target,
        action: RuleAction::Delete,
        origin: IntentOrigin::Direct,
    };
    let ids = event.target.ids().iter().filter(|id| !id.is_empty());

    Ok(match event.scope {
        InvalidationScope::Key => ids.map(|id| intent(IntentTarget::Key(id.clone()))).collect(),
        InvalidationScope::Pattern => ids
            .map(|id| KeyPattern::parse(id).map(|pattern| intent(IntentTarget::Pattern(pattern))))
            .collect::<Result<_, _>>()?,
        InvalidationScope::Tag => vec![intent(IntentTarget::Tags(ids.cloned().collect()))],
        InvalidationScope::Global => vec![intent(IntentTarget::Global)],
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::Priority;
    use crate::invalidation::event::InvalidationType;

    fn coordinator(config: PropagationConfig) -> InvalidationCoordinator {
        InvalidationCoordinator::new(
            CacheContext::default(),
            config,
            Arc::new(EventQueue::new("intents")),
        )
    }

    fn targets(coordinator: &InvalidationCoordinator) -> Vec<String> {
        coordinator
            .intents()
            .snapshot()
            .into_iter()
            .map(|intent| intent.target.to_string())
            .collect()
    }

    #[test]
    fn key_scope_publishes_one_intent_per_id() {
        let coordinator = coordinator(PropagationConfig::default());
        let event = InvalidationEvent::content_change(
            "editor",
            vec!["a".to_string(), "b".to_string()],
        );
        let outcome = coordinator.invalidate(&event).expect("invalidate");
        assert_eq!(outcome.intents, 2);
        assert_eq!(targets(&coordinator), vec!["key:a", "key:b"]);
    }

    #[test]
    fn tag_and_global_scopes() {
        let coordinator = coordinator(PropagationConfig::default());
        coordinator
            .invalidate(
                &InvalidationEvent::new(InvalidationType::Manual, "ops", "hero")
                    .with_scope(InvalidationScope::Tag),
            )
            .expect("tag");
        coordinator
            .invalidate(
                &InvalidationEvent::new(InvalidationType::Manual, "ops", "")
                    .with_scope(InvalidationScope::Global),
            )
            .expect("global");
        assert_eq!(targets(&coordinator), vec!["tags:hero", "global"]);
    }

    #[test]
    fn empty_target_is_rejected() {
        let coordinator = coordinator(PropagationConfig::default());
        let err = coordinator
            .invalidate(&InvalidationEvent::content_change("editor", ""))
            .expect_err("empty");
        assert!(matches!(err, InvalidationError::EmptyTarget { .. }));
        assert_eq!(coordinator.stats().failed, 1);
    }

    #[test]
    fn invalid_regex_pattern_is_rejected() {
        let coordinator = coordinator(PropagationConfig::default());
        let err = coordinator
            .invalidate(
                &InvalidationEvent::content_change("editor", "/(unclosed/")
                    .with_scope(InvalidationScope::Pattern),
            )
            .expect_err("bad regex");
        assert!(matches!(err, InvalidationError::InvalidPattern(_)));
        assert!(coordinator.intents().is_empty());
    }

    #[test]
    fn direct_intent_precedes_rule_cascades() {
        let coordinator = coordinator(PropagationConfig::default());
        coordinator.add_rule(
            InvalidationRule::new("lists", KeyPattern::contains("post:"))
                .on(InvalidationType::ContentChange)
                .cascade_to(KeyPattern::contains("list:"))
                .with_action(RuleAction::Refresh),
        );

        let outcome = coordinator
            .invalidate(&InvalidationEvent::content_change("editor", "post:1"))
            .expect("invalidate");
        assert_eq!(outcome.rules_applied, vec!["lists".to_string()]);

        let intents = coordinator.intents().snapshot();
        assert_eq!(intents[0].origin, IntentOrigin::Direct);
        assert_eq!(intents[1].origin, IntentOrigin::Rule("lists".to_string()));
        assert_eq!(intents[1].action, RuleAction::Refresh);
    }

    #[test]
    fn derived_events_wait_in_the_propagation_queue() {
        let coordinator = coordinator(PropagationConfig::default());
        coordinator.add_dependency("page:home", "content:hero", NodeType::Component);

        let outcome = coordinator
            .invalidate(
                &InvalidationEvent::content_change("editor", "content:hero").with_propagate(true),
            )
            .expect("invalidate");
        assert_eq!(outcome.derived, 1);
        assert_eq!(targets(&coordinator), vec!["key:content:hero"]);
        assert_eq!(coordinator.pending_propagation(), 1);

        assert_eq!(coordinator.process_propagation_queue(), 1);
        assert_eq!(
            targets(&coordinator),
            vec!["key:content:hero", "key:page:home"]
        );
        assert_eq!(coordinator.pending_propagation(), 0);
        assert!(
            coordinator
                .graph()
                .node("page:home")
                .expect("node")
                .last_invalidated_at
                .is_some()
        );
    }

    #[test]
    fn version_helpers_use_context_strategy() {
        let coordinator = coordinator(PropagationConfig::default());
        let first = coordinator.create_version(&json!({"a": 1}), &[], Map::new());
        let second = coordinator.create_version(&json!({"a": 2}), &[], Map::new());
        assert_eq!(second.parent_version.as_deref(), Some(first.version.as_str()));
        assert_eq!(
            coordinator.compare_versions(&first.version, &second.version),
            Ordering::Less
        );
        assert!(coordinator.is_version_valid(&second.version, &first.version));
        assert!(!coordinator.is_version_valid(&first.version, &second.version));
    }

    #[test]
    fn rule_administration() {
        let coordinator = coordinator(PropagationConfig::default());
        coordinator.add_rule(InvalidationRule::new("a", KeyPattern::contains("x")).with_priority(1));
        coordinator.add_rule(InvalidationRule::new("b", KeyPattern::contains("x")).with_priority(9));
        let ids: Vec<String> = coordinator.rules().into_iter().map(|rule| rule.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);

        assert!(coordinator.set_rule_enabled("a", false));
        assert!(coordinator.remove_rule("b"));
        assert!(!coordinator.remove_rule("b"));
        assert_eq!(coordinator.rules().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_orders_by_priority_and_counts_failures() {
        let coordinator = coordinator(PropagationConfig {
            batch_size: 2,
            delay_ms: 50,
            ..Default::default()
        });
        let events = vec![
            InvalidationEvent::content_change("s", "low").with_priority(Priority::Low),
            InvalidationEvent::content_change("s", "").with_priority(Priority::Medium),
            InvalidationEvent::content_change("s", "critical").with_priority(Priority::Critical),
            InvalidationEvent::content_change("s", "high").with_priority(Priority::High),
        ];

        let summary = coordinator.invalidate_batch(events).await;
        assert_eq!(
            summary,
            BatchSummary {
                processed: 3,
                failed: 1,
                batches: 2
            }
        );
        assert_eq!(
            targets(&coordinator),
            vec!["key:critical", "key:high", "key:low"]
        );
    }
}
