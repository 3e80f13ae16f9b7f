//! Session strategies and execution ordering.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use time::OffsetDateTime;

use super::target::WarmingTarget;
use super::usage::UsageTracker;

/// How a session picks its targets when none are given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingStrategy {
    /// Highest priority levels, filtered by conditions when a context is supplied.
    Critical,
    /// Top-N most accessed keys.
    Popular,
    /// Keys whose peak hours include the current hour.
    Temporal,
    /// Targets with a location condition matching the context.
    Geographic,
    /// Keys the prediction model expects to be requested soon.
    Predictive,
    /// Auto-queued and refresh-requested targets.
    #[default]
    Queued,
}

impl WarmingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Popular => "popular",
            Self::Temporal => "temporal",
            Self::Geographic => "geographic",
            Self::Predictive => "predictive",
            Self::Queued => "queued",
        }
    }
}

impl fmt::Display for WarmingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WarmingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "popular" => Ok(Self::Popular),
            "temporal" => Ok(Self::Temporal),
            "geographic" => Ok(Self::Geographic),
            "predictive" => Ok(Self::Predictive),
            "queued" => Ok(Self::Queued),
            other => Err(format!("unknown warming strategy `{other}`")),
        }
    }
}

/// Order in which selected targets are handed to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAlgorithm {
    #[default]
    Weighted,
    Strict,
    RoundRobin,
}

impl fmt::Display for PriorityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Weighted => "weighted",
            Self::Strict => "strict",
            Self::RoundRobin => "round_robin",
        })
    }
}

impl FromStr for PriorityAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted" => Ok(Self::Weighted),
            "strict" => Ok(Self::Strict),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(format!("unknown priority algorithm `{other}`")),
        }
    }
}

/// `priority×10 + frequency×0.1 + recency_bonus − load_ms×0.001`, where the
/// recency bonus falls linearly from 10 to 0 over the 24h after the last access.
pub fn weighted_score(target: &WarmingTarget, usage: &UsageTracker, now: OffsetDateTime) -> f64 {
    let pattern = usage.get(&target.key);
    let frequency = pattern.as_ref().map_or(0, |pattern| pattern.frequency);
    let recency_bonus = pattern
        .and_then(|pattern| pattern.last_seen_at)
        .map_or(0.0, |last_seen| {
            let hours = (now - last_seen).as_seconds_f64() / 3600.0;
            10.0 * (1.0 - hours / 24.0).max(0.0)
        });
    f64::from(target.priority) * 10.0 + frequency as f64 * 0.1 + recency_bonus
        - target.estimated_load_time_ms as f64 * 0.001
}

/// Sort `targets` for execution. All orderings are stable.
pub fn order_targets(
    mut targets: Vec<WarmingTarget>,
    algorithm: PriorityAlgorithm,
    usage: &UsageTracker,
    now: OffsetDateTime,
) -> Vec<WarmingTarget> {
    match algorithm {
        PriorityAlgorithm::Weighted => {
            let mut scored: Vec<(f64, WarmingTarget)> = targets
                .into_iter()
                .map(|target| (weighted_score(&target, usage, now), target))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            scored.into_iter().map(|(_, target)| target).collect()
        }
        PriorityAlgorithm::Strict => {
            targets.sort_by(|a, b| b.priority.cmp(&a.priority));
            targets
        }
        PriorityAlgorithm::RoundRobin => {
            let mut buckets: BTreeMap<u32, Vec<WarmingTarget>> = BTreeMap::new();
            for target in targets {
                buckets.entry(target.priority).or_default().push(target);
            }
            let mut buckets: Vec<std::vec::IntoIter<WarmingTarget>> =
                buckets.into_values().rev().map(Vec::into_iter).collect();
            let mut ordered = Vec::new();
            loop {
                let before = ordered.len();
                for bucket in &mut buckets {
                    ordered.extend(bucket.next());
                }
                if ordered.len() == before {
                    break ordered;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration;
    use time::macros::datetime;

    use super::*;
    use crate::warming::target::fetcher_fn;

    fn target(id: &str, priority: u32) -> WarmingTarget {
        WarmingTarget::new(id, id, fetcher_fn(|| async { Ok(json!(null)) })).with_priority(priority)
    }

    fn ids(targets: &[WarmingTarget]) -> Vec<&str> {
        targets.iter().map(|target| target.id.as_str()).collect()
    }

    #[test]
    fn weighted_score_combines_priority_usage_and_cost() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let usage = UsageTracker::default();
        for _ in 0..10 {
            usage.record("hot", now - Duration::hours(12), None);
        }

        let hot = target("hot", 2).with_estimated_load_time(1_000);
        // 20 + 1 + 5 - 1
        assert!((weighted_score(&hot, &usage, now) - 25.0).abs() < 1e-9);
        assert!((weighted_score(&target("cold", 2), &usage, now) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn strict_keeps_submission_order_within_a_priority() {
        let ordered = order_targets(
            vec![target("a", 1), target("b", 3), target("c", 1)],
            PriorityAlgorithm::Strict,
            &UsageTracker::default(),
            datetime!(2024-05-01 12:00 UTC),
        );
        assert_eq!(ids(&ordered), vec!["b", "a", "c"]);
    }

    #[test]
    fn round_robin_interleaves_priority_buckets() {
        let ordered = order_targets(
            vec![
                target("h1", 3),
                target("h2", 3),
                target("l1", 1),
                target("m1", 2),
                target("l2", 1),
            ],
            PriorityAlgorithm::RoundRobin,
            &UsageTracker::default(),
            datetime!(2024-05-01 12:00 UTC),
        );
        assert_eq!(ids(&ordered), vec!["h1", "m1", "l1", "h2", "l2"]);
    }

    #[test]
    fn strategy_names_parse() {
        for strategy in [
            WarmingStrategy::Critical,
            WarmingStrategy::Popular,
            WarmingStrategy::Temporal,
            WarmingStrategy::Geographic,
            WarmingStrategy::Predictive,
            WarmingStrategy::Queued,
        ] {
            assert_eq!(strategy.as_str().parse::<WarmingStrategy>(), Ok(strategy));
        }
    }
}
