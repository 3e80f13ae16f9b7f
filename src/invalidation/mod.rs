//! Versioned, dependency-driven invalidation.
//!
//! ```toml
//! [propagation]
//! max_depth = 5
//! batch_size = 10
//! delay_ms = 100
//!
//! [[rules]]
//! id = "post-lists"
//! pattern = "post:"
//! triggers = ["content_change"]
//! cascade = ["list:"]
//! priority = 100
//! ```

mod config;
mod coordinator;
mod error;
mod event;
mod graph;
mod rules;
mod version;

pub use config::PropagationConfig;
pub use coordinator::{
    BatchSummary, CoordinatorStats, InvalidationCoordinator, InvalidationOutcome,
};
pub use error::InvalidationError;
pub use event::{
    EventTarget, IntentOrigin, IntentTarget, InvalidationEvent, InvalidationIntent,
    InvalidationScope, InvalidationType, RuleAction,
};
pub use graph::{DependencyGraph, DependencyNode, NodeType, Traversal};
pub use rules::{InvalidationRule, RulePredicate, RuleSet};
pub use version::{
    CacheVersion, VersionGenerator, VersionStrategy, compare_versions, content_digest,
};
pub(crate) use version::unix_millis;
