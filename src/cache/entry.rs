//! Cache entries and write options.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

/// Payload type stored in every layer.
pub type CacheValue = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Options accepted by `set` on the orchestrator and on each layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Time to live in seconds. `None` uses the layer default, `Some(0)` never expires.
    pub ttl_seconds: Option<u64>,
    pub tags: BTreeSet<String>,
    pub priority: Priority,
    /// Filled in by the orchestrator when absent.
    pub version: Option<String>,
}

impl SetOptions {
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// One stored value plus its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: CacheValue,
    pub created_at: OffsetDateTime,
    /// Zero means no expiry.
    pub ttl_seconds: u64,
    pub version: Option<String>,
    pub size_bytes: usize,
    pub access_count: u64,
    pub last_accessed_at: OffsetDateTime,
    pub priority: Priority,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: CacheValue,
        options: &SetOptions,
        default_ttl_seconds: u64,
        now: OffsetDateTime,
    ) -> Self {
        let size_bytes = value.to_string().len();
        Self {
            key: key.into(),
            value,
            created_at: now,
            ttl_seconds: options.ttl_seconds.unwrap_or(default_ttl_seconds),
            version: options.version.clone(),
            size_bytes,
            access_count: 0,
            last_accessed_at: now,
            priority: options.priority,
            tags: options.tags.clone(),
        }
    }

    /// Expired iff `now > created_at + ttl`.
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at().is_some_and(|deadline| now > deadline)
    }

    /// `None` when the entry never expires, including TTLs past the representable date range.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        if self.ttl_seconds == 0 {
            return None;
        }
        let ttl = i64::try_from(self.ttl_seconds).ok()?;
        self.created_at.checked_add(Duration::seconds(ttl))
    }

    /// Record a read.
    pub fn touch(&mut self, now: OffsetDateTime) {
        self.access_count += 1;
        self.last_accessed_at = now;
    }

    /// Options that recreate this entry elsewhere with its remaining lifetime.
    pub fn carry_options(&self, now: OffsetDateTime) -> SetOptions {
        let ttl_seconds = match self.expires_at() {
            None => 0,
            Some(deadline) => u64::try_from((deadline - now).whole_seconds()).unwrap_or(0).max(1),
        };
        SetOptions {
            ttl_seconds: Some(ttl_seconds),
            tags: self.tags.clone(),
            priority: self.priority,
            version: self.version.clone(),
        }
    }
}
