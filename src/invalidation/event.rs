//! Invalidation events and the intents derived from them.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::Priority;
use crate::pattern::KeyPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationType {
    ContentChange,
    SchemaChange,
    PermissionChange,
    Manual,
}

impl InvalidationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentChange => "content_change",
            Self::SchemaChange => "schema_change",
            Self::PermissionChange => "permission_change",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for InvalidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvalidationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_change" => Ok(Self::ContentChange),
            "schema_change" => Ok(Self::SchemaChange),
            "permission_change" => Ok(Self::PermissionChange),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown invalidation type `{other}`")),
        }
    }
}

/// How an event's target is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationScope {
    #[default]
    Key,
    Pattern,
    Tag,
    Global,
}

impl fmt::Display for InvalidationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Key => "key",
            Self::Pattern => "pattern",
            Self::Tag => "tag",
            Self::Global => "global",
        })
    }
}

/// One id or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    One(String),
    Many(Vec<String>),
}

impl EventTarget {
    pub fn ids(&self) -> &[String] {
        match self {
            Self::One(id) => std::slice::from_ref(id),
            Self::Many(ids) => ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids().iter().all(|id| id.is_empty())
    }
}

impl From<&str> for EventTarget {
    fn from(id: &str) -> Self {
        Self::One(id.to_string())
    }
}

impl From<String> for EventTarget {
    fn from(id: String) -> Self {
        Self::One(id)
    }
}

impl From<Vec<String>> for EventTarget {
    fn from(ids: Vec<String>) -> Self {
        Self::Many(ids)
    }
}

impl fmt::Display for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(id) => f.write_str(id),
            Self::Many(ids) => write!(f, "[{}]", ids.join(", ")),
        }
    }
}

/// A request to invalidate something, optionally cascading through the dependency graph.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationEvent {
    pub id: Uuid,
    pub kind: InvalidationType,
    pub source: String,
    pub target: EventTarget,
    pub scope: InvalidationScope,
    pub priority: Priority,
    pub propagate: bool,
    pub version: Option<String>,
    pub metadata: Map<String, Value>,
}

impl InvalidationEvent {
    /// Key-scoped, medium priority, not propagating.
    pub fn new(
        kind: InvalidationType,
        source: impl Into<String>,
        target: impl Into<EventTarget>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source: source.into(),
            target: target.into(),
            scope: InvalidationScope::Key,
            priority: Priority::Medium,
            propagate: false,
            version: None,
            metadata: Map::new(),
        }
    }

    pub fn content_change(source: impl Into<String>, target: impl Into<EventTarget>) -> Self {
        Self::new(InvalidationType::ContentChange, source, target)
    }

    pub fn with_scope(mut self, scope: InvalidationScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_propagate(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Event re-emitted for a dependent node. Never propagates further.
    pub(crate) fn derived_for(&self, dependent: &str) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert("cause".to_string(), Value::String(self.id.to_string()));
        Self {
            id: Uuid::new_v4(),
            kind: self.kind,
            source: format!("cascade:{}", self.source),
            target: EventTarget::One(dependent.to_string()),
            scope: InvalidationScope::Key,
            priority: self.priority,
            propagate: false,
            version: self.version.clone(),
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Delete,
    Refresh,
    MarkStale,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Delete => "delete",
            Self::Refresh => "refresh",
            Self::MarkStale => "mark_stale",
        })
    }
}

/// What a consumer should remove from the cache layers.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentTarget {
    Key(String),
    Pattern(KeyPattern),
    Tags(Vec<String>),
    Global,
}

impl fmt::Display for IntentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key:{key}"),
            Self::Pattern(pattern) => write!(f, "pattern:{pattern}"),
            Self::Tags(tags) => write!(f, "tags:{}", tags.join(",")),
            Self::Global => f.write_str("global"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOrigin {
    /// The event's own scope.
    Direct,
    /// A matching rule's cascade, carrying the rule id.
    Rule(String),
}

/// Instruction published by the coordinator; applied by the intent consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationIntent {
    pub event_id: Uuid,
    pub target: IntentTarget,
    pub action: RuleAction,
    pub origin: IntentOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_events_never_propagate() {
        let event = InvalidationEvent::content_change("editor", "content:hero")
            .with_propagate(true)
            .with_priority(Priority::High)
            .with_version("42");

        let derived = event.derived_for("page:home");
        assert!(!derived.propagate);
        assert_eq!(derived.target, EventTarget::One("page:home".to_string()));
        assert_eq!(derived.scope, InvalidationScope::Key);
        assert_eq!(derived.priority, Priority::High);
        assert_eq!(derived.version.as_deref(), Some("42"));
        assert_eq!(
            derived.metadata.get("cause"),
            Some(&Value::String(event.id.to_string()))
        );
        assert_ne!(derived.id, event.id);
    }

    #[test]
    fn target_ids_cover_both_forms() {
        assert_eq!(EventTarget::from("a").ids(), ["a".to_string()]);
        let many = EventTarget::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(many.ids().len(), 2);
        assert_eq!(many.to_string(), "[a, b]");
        assert!(EventTarget::from("").is_empty());
        assert!(EventTarget::Many(Vec::new()).is_empty());
    }

    #[test]
    fn invalidation_type_round_trips_through_text() {
        for kind in [
            InvalidationType::ContentChange,
            InvalidationType::SchemaChange,
            InvalidationType::PermissionChange,
            InvalidationType::Manual,
        ] {
            assert_eq!(kind.as_str().parse::<InvalidationType>(), Ok(kind));
        }
        assert!("rename".parse::<InvalidationType>().is_err());
    }
}
