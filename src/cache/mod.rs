//! Multi-layer cache.
//!
//! Layers are registered fastest first:
//!
//! - **memory**: in-process LRU with TTL and a tag index
//! - further layers: anything implementing [`CacheLayer`] (edge caches, network stores)
//!
//! ## Configuration
//!
//! ```toml
//! [[layers]]
//! name = "memory"
//! ttl_seconds = 300
//! max_entries = 1000
//!
//! [[layers]]
//! name = "edge"
//! read_only = true
//! ```

mod config;
mod consumer;
mod entry;
mod error;
mod layer;
mod metrics;
mod orchestrator;
mod store;

pub use config::{LayerConfig, OrchestratorConfig};
pub use consumer::IntentConsumer;
pub use entry::{CacheEntry, CacheValue, Priority, SetOptions};
pub use error::{LayerError, OrchestratorError};
pub use layer::{CacheLayer, LayerCapabilities, LayerMetrics};
pub use metrics::MetricsSnapshot;
pub use orchestrator::{CacheOrchestrator, FanOutReport, LayerOutcome};
pub use store::MemoryLayer;
