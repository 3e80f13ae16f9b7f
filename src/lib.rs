//! Multi-layer cache orchestration with dependency-driven invalidation and
//! usage-driven warming.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod invalidation;
mod lock;
pub mod pattern;
pub mod runtime;
pub mod telemetry;
pub mod warming;
pub mod workers;
