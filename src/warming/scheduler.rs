//! Warming scheduler: target registry, usage tracking, and the session executor.
//!
//! The scheduler never writes to cache layers. Fetched values are published as
//! [`WarmingData`] and applied by the intent consumer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition::{ConditionKind, WarmingContext};
use super::config::WarmingConfig;
use super::error::{FetchError, WarmingError};
use super::prediction::PredictionModel;
use super::rate::RateGate;
use super::session::{SkipReason, TargetOutcome, WarmingSession};
use super::strategy::{WarmingStrategy, order_targets};
use super::target::{WarmingData, WarmingTarget};
use super::usage::{UsagePatternSnapshot, UsageTracker};
use crate::context::CacheContext;
use crate::events::{CacheEvent, EventQueue};
use crate::lock::{mutex_lock, rw_read, rw_write};
use crate::pattern::KeyPattern;

const SOURCE: &str = "warming::scheduler";
const METRIC_TARGET_OUTCOME: &str = "tiercache_warming_target_total";
const METRIC_SESSION_MS: &str = "tiercache_warming_session_ms";
const PREDICTION_THRESHOLD: f64 = 0.5;

/// Parameters of one session.
#[derive(Debug, Clone, Default)]
pub struct WarmingRequest {
    pub strategy: WarmingStrategy,
    /// Explicit target ids; bypasses strategy selection.
    pub targets: Option<Vec<String>>,
    pub context: WarmingContext,
}

impl WarmingRequest {
    pub fn new(strategy: WarmingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn with_targets(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.targets = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_context(mut self, context: WarmingContext) -> Self {
        self.context = context;
        self
    }
}

/// Clears the single-flight slot when a session ends, however it ends.
struct ActiveSession<'a> {
    slot: &'a Mutex<Option<Uuid>>,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        *mutex_lock(self.slot, SOURCE, "release_session") = None;
    }
}

/// Shared per-session execution state.
struct SessionRun<'a> {
    session_id: Uuid,
    context: &'a WarmingContext,
    permits: Semaphore,
    rate: RateGate,
    started: Instant,
    fetched_bytes: AtomicUsize,
}

pub struct WarmingScheduler {
    context: CacheContext,
    config: WarmingConfig,
    targets: RwLock<BTreeMap<String, WarmingTarget>>,
    queued: Mutex<VecDeque<String>>,
    usage: UsageTracker,
    model: Arc<dyn PredictionModel>,
    output: Arc<EventQueue<WarmingData>>,
    active: Mutex<Option<Uuid>>,
    history: Mutex<VecDeque<WarmingSession>>,
}

impl WarmingScheduler {
    pub fn new(
        context: CacheContext,
        config: WarmingConfig,
        output: Arc<EventQueue<WarmingData>>,
    ) -> Self {
        let model = config.model.build();
        Self::with_model(context, config, output, model)
    }

    pub fn with_model(
        context: CacheContext,
        config: WarmingConfig,
        output: Arc<EventQueue<WarmingData>>,
        model: Arc<dyn PredictionModel>,
    ) -> Self {
        Self {
            context,
            config,
            targets: RwLock::new(BTreeMap::new()),
            queued: Mutex::new(VecDeque::new()),
            usage: UsageTracker::default(),
            model,
            output,
            active: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &WarmingConfig {
        &self.config
    }

    pub fn output(&self) -> &Arc<EventQueue<WarmingData>> {
        &self.output
    }

    /// Register or replace a target. High-priority targets are queued immediately.
    pub fn add_target(&self, target: WarmingTarget) -> Option<WarmingTarget> {
        let id = target.id.clone();
        let auto_queue = target.priority >= self.config.auto_queue_threshold();
        let replaced = rw_write(&self.targets, SOURCE, "add_target").insert(id.clone(), target);
        if auto_queue {
            self.enqueue(&id);
        }
        debug!(target_id = %id, auto_queue, "Warming target registered");
        replaced
    }

    pub fn remove_target(&self, id: &str) -> bool {
        mutex_lock(&self.queued, SOURCE, "remove_target").retain(|queued| queued != id);
        rw_write(&self.targets, SOURCE, "remove_target")
            .remove(id)
            .is_some()
    }

    pub fn target_ids(&self) -> Vec<String> {
        rw_read(&self.targets, SOURCE, "target_ids")
            .keys()
            .cloned()
            .collect()
    }

    /// Ids waiting for the next `queued` session.
    pub fn queued(&self) -> Vec<String> {
        mutex_lock(&self.queued, SOURCE, "queued")
            .iter()
            .cloned()
            .collect()
    }

    /// Queue every target whose cache key matches `pattern`. Returns how many were queued.
    pub fn queue_refresh(&self, pattern: &KeyPattern) -> usize {
        let matching: Vec<String> = rw_read(&self.targets, SOURCE, "queue_refresh")
            .values()
            .filter(|target| pattern.matches(&target.key))
            .map(|target| target.id.clone())
            .collect();
        let queued = matching.iter().filter(|id| self.enqueue(id)).count();
        if queued > 0 {
            debug!(pattern = %pattern, queued, "Warming targets queued for refresh");
        }
        queued
    }

    fn enqueue(&self, id: &str) -> bool {
        let mut queued = mutex_lock(&self.queued, SOURCE, "enqueue");
        if queued.iter().any(|existing| existing == id) {
            return false;
        }
        queued.push_back(id.to_string());
        true
    }

    /// Feed one cache access into usage tracking and the prediction model.
    pub fn record_access(&self, key: &str, context: &WarmingContext) {
        let now = self.context.now();
        self.usage
            .record(key, now, context.user_segment.as_deref());
        self.model.observe(key, now);
    }

    pub fn usage_pattern(&self, key: &str) -> Option<UsagePatternSnapshot> {
        self.usage.get(key)
    }

    pub fn reset_pattern(&self, key: &str) -> bool {
        self.usage.reset(key)
    }

    pub fn refresh_model(&self) {
        self.model.refresh();
        debug!(
            model = self.model.name(),
            patterns = self.usage.len(),
            "Prediction model refreshed"
        );
    }

    pub fn active_session(&self) -> Option<Uuid> {
        *mutex_lock(&self.active, SOURCE, "active_session")
    }

    /// Finished sessions, oldest first.
    pub fn sessions(&self) -> Vec<WarmingSession> {
        mutex_lock(&self.history, SOURCE, "sessions")
            .iter()
            .cloned()
            .collect()
    }

    /// Run one session. Only one session runs at a time.
    pub async fn start_warming_session(
        &self,
        request: WarmingRequest,
    ) -> Result<WarmingSession, WarmingError> {
        let session_id = Uuid::new_v4();
        let _active = self.claim(session_id)?;
        let started = Instant::now();
        let mut session = WarmingSession::new(session_id, request.strategy, self.context.now());

        let selected = match &request.targets {
            Some(ids) => match self.lookup(ids) {
                Ok(targets) => targets,
                Err(err) => {
                    session.fail(self.context.now(), err.to_string());
                    warn!(session_id = %session_id, error = %err, "Warming session setup failed");
                    self.finish(session.clone());
                    self.context.emit(CacheEvent::SessionFailed {
                        session,
                        error: err.to_string(),
                    });
                    return Err(err);
                }
            },
            None => self.select(request.strategy, &request.context),
        };
        let ordered = order_targets(
            selected,
            self.config.algorithm,
            &self.usage,
            self.context.now(),
        );
        session.start(ordered.iter().map(|target| target.id.clone()).collect());

        info!(
            session_id = %session_id,
            strategy = %request.strategy,
            algorithm = %self.config.algorithm,
            targets = ordered.len(),
            "Warming session starting"
        );

        let run = SessionRun {
            session_id,
            context: &request.context,
            permits: Semaphore::new(self.config.max_concurrent()),
            rate: RateGate::new(self.config.rate_per_second),
            started,
            fetched_bytes: AtomicUsize::new(0),
        };
        let outcomes = join_all(ordered.iter().map(|target| self.run_target(&run, target))).await;

        for (target, outcome) in ordered.iter().zip(&outcomes) {
            session.record(outcome);
            counter!(METRIC_TARGET_OUTCOME, "outcome" => outcome.label()).increment(1);
            match outcome {
                TargetOutcome::Failed(err) => warn!(
                    session_id = %session_id,
                    target_id = %target.id,
                    error = %err,
                    "Warming target failed"
                ),
                TargetOutcome::Skipped(reason) => debug!(
                    session_id = %session_id,
                    target_id = %target.id,
                    reason = reason.as_str(),
                    "Warming target skipped"
                ),
                TargetOutcome::Completed { .. } => {}
            }
        }
        session.complete(self.context.now());
        histogram!(METRIC_SESSION_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        info!(
            session_id = %session_id,
            completed = session.completed,
            failed = session.failed,
            skipped = session.skipped,
            fetched_bytes = session.fetched_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Warming session complete"
        );
        self.finish(session.clone());
        self.context.emit(CacheEvent::SessionCompleted {
            session: session.clone(),
        });
        Ok(session)
    }

    fn claim(&self, session_id: Uuid) -> Result<ActiveSession<'_>, WarmingError> {
        let mut active = mutex_lock(&self.active, SOURCE, "claim_session");
        if let Some(current) = *active {
            return Err(WarmingError::SessionAlreadyActive { active: current });
        }
        *active = Some(session_id);
        Ok(ActiveSession { slot: &self.active })
    }

    fn finish(&self, session: WarmingSession) {
        let mut history = mutex_lock(&self.history, SOURCE, "finish");
        history.push_back(session);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    fn lookup(&self, ids: &[String]) -> Result<Vec<WarmingTarget>, WarmingError> {
        let targets = rw_read(&self.targets, SOURCE, "lookup");
        ids.iter()
            .map(|id| {
                targets
                    .get(id)
                    .cloned()
                    .ok_or_else(|| WarmingError::UnknownTarget(id.clone()))
            })
            .collect()
    }

    fn select(&self, strategy: WarmingStrategy, context: &WarmingContext) -> Vec<WarmingTarget> {
        let now = self.context.now();
        let levels = self.config.priority_levels();

        if strategy == WarmingStrategy::Queued {
            let ids: Vec<String> = mutex_lock(&self.queued, SOURCE, "select")
                .drain(..)
                .collect();
            let targets = rw_read(&self.targets, SOURCE, "select");
            return ids.iter().filter_map(|id| targets.get(id).cloned()).collect();
        }

        let targets = rw_read(&self.targets, SOURCE, "select");
        let all = targets.values();
        match strategy {
            WarmingStrategy::Critical => all
                .filter(|target| target.priority >= self.config.critical_threshold())
                .filter(|target| {
                    context.is_empty()
                        || target
                            .conditions
                            .iter()
                            .all(|condition| condition.evaluate(context, now))
                })
                .cloned()
                .collect(),
            WarmingStrategy::Popular => {
                let mut popular: Vec<(u64, &WarmingTarget)> = all
                    .map(|target| (self.usage.frequency(&target.key), target))
                    .filter(|(frequency, _)| *frequency > 0)
                    .collect();
                popular.sort_by(|a, b| b.0.cmp(&a.0));
                popular
                    .into_iter()
                    .take(self.config.popular_top_n)
                    .map(|(_, target)| target.clone())
                    .collect()
            }
            WarmingStrategy::Temporal => all
                .filter(|target| {
                    self.usage
                        .get(&target.key)
                        .is_some_and(|pattern| pattern.includes_hour(now.hour()))
                })
                .cloned()
                .collect(),
            WarmingStrategy::Geographic => {
                if context.location.is_none() {
                    return Vec::new();
                }
                all.filter(|target| {
                    target.conditions.iter().any(|condition| {
                        condition.kind == ConditionKind::Location
                            && condition.evaluate(context, now)
                    })
                })
                .cloned()
                .collect()
            }
            WarmingStrategy::Predictive => all
                .filter_map(|target| {
                    let pattern = self.usage.get(&target.key)?;
                    let probability = self.model.predict(&pattern, now);
                    (probability > PREDICTION_THRESHOLD).then(|| {
                        let mut target = target.clone();
                        target.priority = (probability * f64::from(levels)).round() as u32;
                        target
                    })
                })
                .collect(),
            WarmingStrategy::Queued => Vec::new(),
        }
    }

    async fn run_target(&self, run: &SessionRun<'_>, target: &WarmingTarget) -> TargetOutcome {
        let Ok(_permit) = run.permits.acquire().await else {
            return TargetOutcome::Skipped(SkipReason::TimeBudget);
        };

        let budget = self.config.max_warming_time();
        if run.started.elapsed() > budget {
            return TargetOutcome::Skipped(SkipReason::TimeBudget);
        }

        let now = self.context.now();
        if !target
            .conditions
            .iter()
            .all(|condition| condition.evaluate(run.context, now))
        {
            return TargetOutcome::Skipped(SkipReason::ConditionUnmet);
        }

        run.rate.acquire().await;
        let remaining = budget.saturating_sub(run.started.elapsed());
        if remaining.is_zero() {
            return TargetOutcome::Skipped(SkipReason::TimeBudget);
        }

        let value = match tokio::time::timeout(remaining, target.fetcher.fetch()).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return TargetOutcome::Failed(err),
            Err(_) => {
                return TargetOutcome::Failed(FetchError::TimedOut {
                    after_ms: remaining.as_millis() as u64,
                });
            }
        };

        if let Some(validator) = &target.validator
            && !validator(&value)
        {
            return TargetOutcome::Failed(FetchError::ValidationFailed);
        }
        let value = match &target.transformer {
            Some(transformer) => transformer(value),
            None => value,
        };

        let bytes = value.to_string().len();
        let before = run.fetched_bytes.fetch_add(bytes, Ordering::SeqCst);
        if before + bytes > self.config.max_memory_bytes {
            run.fetched_bytes.fetch_sub(bytes, Ordering::SeqCst);
            return TargetOutcome::Skipped(SkipReason::MemoryBudget);
        }

        let data = WarmingData {
            key: target.key.clone(),
            value,
            target_id: target.id.clone(),
            session_id: run.session_id,
        };
        if !self.output.publish(data.clone()) {
            return TargetOutcome::Failed(FetchError::failed("warming output queue full"));
        }
        self.context.emit(CacheEvent::WarmingData(data));
        TargetOutcome::Completed { bytes }
    }
}
