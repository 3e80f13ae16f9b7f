//! Access prediction models.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Deserialize;
use time::OffsetDateTime;

use super::usage::UsagePatternSnapshot;

const DAY_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Estimates how likely a key is to be requested soon, in `[0, 1]`.
pub trait PredictionModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Feed one access. Models that only read usage patterns ignore it.
    fn observe(&self, _key: &str, _at: OffsetDateTime) {}

    fn predict(&self, pattern: &UsagePatternSnapshot, now: OffsetDateTime) -> f64;

    /// Periodic maintenance (decay, retraining).
    fn refresh(&self) {}
}

/// `max(0, 1 - time_since_last_access / average_interval)` with
/// `average_interval = 24h / frequency`. Zero frequency predicts 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalModel;

impl PredictionModel for IntervalModel {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn predict(&self, pattern: &UsagePatternSnapshot, now: OffsetDateTime) -> f64 {
        let Some(last_seen) = pattern.last_seen_at else {
            return 0.0;
        };
        if pattern.frequency == 0 {
            return 0.0;
        }
        let average_interval_ms = DAY_MS / pattern.frequency as f64;
        let since_ms = ((now - last_seen).whole_milliseconds() as f64).max(0.0);
        (1.0 - since_ms / average_interval_ms).clamp(0.0, 1.0)
    }
}

/// Share of a key's accesses that fell into the current UTC hour.
#[derive(Default)]
pub struct HourlyModel {
    histograms: DashMap<String, [u64; 24]>,
}

impl PredictionModel for HourlyModel {
    fn name(&self) -> &'static str {
        "hourly"
    }

    fn observe(&self, key: &str, at: OffsetDateTime) {
        self.histograms.entry(key.to_string()).or_insert([0; 24])[usize::from(at.hour())] += 1;
    }

    fn predict(&self, pattern: &UsagePatternSnapshot, now: OffsetDateTime) -> f64 {
        let Some(histogram) = self.histograms.get(&pattern.id) else {
            return 0.0;
        };
        let total: u64 = histogram.iter().sum();
        if total == 0 {
            return 0.0;
        }
        histogram[usize::from(now.hour())] as f64 / total as f64
    }

    /// Halve every bucket so old traffic fades out.
    fn refresh(&self) {
        self.histograms.retain(|_, histogram| {
            for bucket in histogram.iter_mut() {
                *bucket /= 2;
            }
            histogram.iter().any(|bucket| *bucket > 0)
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Interval,
    Hourly,
}

impl ModelKind {
    pub fn build(self) -> Arc<dyn PredictionModel> {
        match self {
            Self::Interval => Arc::new(IntervalModel),
            Self::Hourly => Arc::new(HourlyModel::default()),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interval => "interval",
            Self::Hourly => "hourly",
        })
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "interval" => Ok(Self::Interval),
            "hourly" => Ok(Self::Hourly),
            other => Err(format!("unknown prediction model `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use time::macros::datetime;

    use super::*;

    fn pattern(frequency: u64, last_seen_at: Option<OffsetDateTime>) -> UsagePatternSnapshot {
        UsagePatternSnapshot {
            id: "k".to_string(),
            frequency,
            peak_hours: Vec::new(),
            user_segments: Vec::new(),
            last_seen_at,
        }
    }

    #[test]
    fn interval_model_decays_with_time_since_last_access() {
        let now = datetime!(2024-05-01 12:00 UTC);
        // 24 accesses a day: one per hour on average.
        let fresh = pattern(24, Some(now - Duration::minutes(15)));
        let stale = pattern(24, Some(now - Duration::hours(2)));

        assert!((IntervalModel.predict(&fresh, now) - 0.75).abs() < 1e-9);
        assert_eq!(IntervalModel.predict(&stale, now), 0.0);
    }

    #[test]
    fn interval_model_floors_zero_frequency_at_zero() {
        let now = datetime!(2024-05-01 12:00 UTC);
        assert_eq!(IntervalModel.predict(&pattern(0, Some(now)), now), 0.0);
        assert_eq!(IntervalModel.predict(&pattern(5, None), now), 0.0);
    }

    #[test]
    fn hourly_model_predicts_share_of_current_hour_and_decays() {
        let model = HourlyModel::default();
        for _ in 0..3 {
            model.observe("k", datetime!(2024-05-01 09:00 UTC));
        }
        model.observe("k", datetime!(2024-05-01 18:00 UTC));

        let snapshot = pattern(4, None);
        assert!((model.predict(&snapshot, datetime!(2024-05-02 09:30 UTC)) - 0.75).abs() < 1e-9);

        model.refresh();
        model.refresh();
        assert_eq!(model.predict(&snapshot, datetime!(2024-05-02 09:30 UTC)), 0.0);
    }

    #[test]
    fn model_kind_parses() {
        assert_eq!("hourly".parse::<ModelKind>(), Ok(ModelKind::Hourly));
        assert_eq!(ModelKind::Interval.build().name(), "interval");
        assert!("neural".parse::<ModelKind>().is_err());
    }
}
