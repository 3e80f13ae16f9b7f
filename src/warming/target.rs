//! Warming targets and the fetch contract.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::condition::WarmingCondition;
use super::error::FetchError;
use crate::cache::CacheValue;

/// Loads the value for one target. Called at most once per session.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<CacheValue, FetchError>;
}

/// Adapts an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(F);

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<CacheValue, FetchError>> + Send,
{
    async fn fetch(&self) -> Result<CacheValue, FetchError> {
        (self.0)().await
    }
}

pub fn fetcher_fn<F, Fut>(fetch: F) -> Arc<dyn Fetcher>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheValue, FetchError>> + Send + 'static,
{
    Arc::new(FnFetcher(fetch))
}

/// Gates success after a fetch. Returning false counts the target as failed.
pub type Validator = Arc<dyn Fn(&CacheValue) -> bool + Send + Sync>;

/// Applied to validated values before they are published.
pub type Transformer = Arc<dyn Fn(CacheValue) -> CacheValue + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetType {
    #[default]
    Content,
    Schema,
    Asset,
    Query,
}

#[derive(Clone)]
pub struct WarmingTarget {
    pub id: String,
    pub target_type: TargetType,
    /// Cache key the fetched value is written under.
    pub key: String,
    pub priority: u32,
    pub estimated_load_time_ms: u64,
    pub dependencies: Vec<String>,
    pub conditions: Vec<WarmingCondition>,
    pub fetcher: Arc<dyn Fetcher>,
    pub validator: Option<Validator>,
    pub transformer: Option<Transformer>,
    pub metadata: Map<String, Value>,
}

impl WarmingTarget {
    pub fn new(id: impl Into<String>, key: impl Into<String>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            id: id.into(),
            target_type: TargetType::default(),
            key: key.into(),
            priority: 0,
            estimated_load_time_ms: 0,
            dependencies: Vec::new(),
            conditions: Vec::new(),
            fetcher,
            validator: None,
            transformer: None,
            metadata: Map::new(),
        }
    }

    pub fn with_type(mut self, target_type: TargetType) -> Self {
        self.target_type = target_type;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_load_time(mut self, ms: u64) -> Self {
        self.estimated_load_time_ms = ms;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_condition(mut self, condition: WarmingCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&CacheValue) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_transformer(
        mut self,
        transformer: impl Fn(CacheValue) -> CacheValue + Send + Sync + 'static,
    ) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

impl fmt::Debug for WarmingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingTarget")
            .field("id", &self.id)
            .field("target_type", &self.target_type)
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("estimated_load_time_ms", &self.estimated_load_time_ms)
            .field("conditions", &self.conditions)
            .field("has_validator", &self.validator.is_some())
            .field("has_transformer", &self.transformer.is_some())
            .finish()
    }
}

/// A fetched, validated value ready to be written by the intent consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmingData {
    pub key: String,
    pub value: CacheValue,
    pub target_id: String,
    pub session_id: Uuid,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn closure_fetchers_are_callable_repeatedly() {
        let fetcher = fetcher_fn(|| async { Ok(json!({"hero": "banner"})) });
        assert_eq!(fetcher.fetch().await.expect("fetch"), json!({"hero": "banner"}));
        assert!(fetcher.fetch().await.is_ok());
    }

    #[test]
    fn builder_sets_optional_hooks() {
        let target = WarmingTarget::new("t", "k", fetcher_fn(|| async { Ok(json!(1)) }))
            .with_priority(4)
            .with_validator(|value| value.is_number())
            .with_transformer(|value| json!({ "wrapped": value }));

        assert_eq!(target.priority, 4);
        let validator = target.validator.as_ref().expect("validator");
        assert!(validator(&json!(1)));
        let transformer = target.transformer.as_ref().expect("transformer");
        assert_eq!(transformer(json!(1)), json!({"wrapped": 1}));
    }
}
