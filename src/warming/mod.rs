//! Priority- and usage-driven cache warming.
//!
//! ```toml
//! [warming]
//! max_concurrent_requests = 4
//! max_warming_time_ms = 30000
//! algorithm = "weighted"   # weighted | strict | round_robin
//! model = "interval"       # interval | hourly
//! ```

mod condition;
mod config;
mod error;
mod prediction;
mod rate;
mod scheduler;
mod session;
mod strategy;
mod target;
mod usage;

pub use condition::{ConditionKind, ConditionOperator, WarmingCondition, WarmingContext};
pub use config::WarmingConfig;
pub use error::{FetchError, WarmingError};
pub use prediction::{HourlyModel, IntervalModel, ModelKind, PredictionModel};
pub use scheduler::{WarmingRequest, WarmingScheduler};
pub use session::{SessionState, SkipReason, TargetOutcome, WarmingSession};
pub use strategy::{PriorityAlgorithm, WarmingStrategy, order_targets, weighted_score};
pub use target::{
    Fetcher, FnFetcher, TargetType, Transformer, Validator, WarmingData, WarmingTarget,
    fetcher_fn,
};
pub use usage::{UsagePatternSnapshot, UsageTracker};
