//! Version generation and comparison.
//!
//! Every strategy produces a string version. Ordering is strategy-specific:
//!
//! - `timestamp`: millisecond counter, compared numerically
//! - `semantic`: dotted numeric components, compared left to right
//! - `hash`: content digest, lexicographic only
//! - `hybrid`: `<millis>-<short digest>`, ordered by the millis prefix with the
//!   digest as a tie-break

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::lock::mutex_lock;

const SOURCE: &str = "invalidation::version";
const HASH_VERSION_LEN: usize = 16;
const HYBRID_HASH_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStrategy {
    Timestamp,
    Semantic,
    Hash,
    #[default]
    Hybrid,
}

impl fmt::Display for VersionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Timestamp => "timestamp",
            Self::Semantic => "semantic",
            Self::Hash => "hash",
            Self::Hybrid => "hybrid",
        })
    }
}

impl FromStr for VersionStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(Self::Timestamp),
            "semantic" => Ok(Self::Semantic),
            "hash" => Ok(Self::Hash),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown version strategy `{other}`")),
        }
    }
}

/// A generated version with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheVersion {
    pub version: String,
    pub created_at: OffsetDateTime,
    /// SHA-256 of the serialized content, hex encoded.
    pub checksum: String,
    pub tags: Vec<String>,
    pub parent_version: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Produces versions for one strategy. Shared through the [`CacheContext`].
///
/// [`CacheContext`]: crate::context::CacheContext
pub struct VersionGenerator {
    strategy: VersionStrategy,
    last_millis: AtomicI64,
    semantic_patch: AtomicU64,
    last_version: Mutex<Option<String>>,
}

impl VersionGenerator {
    pub fn new(strategy: VersionStrategy) -> Self {
        Self {
            strategy,
            last_millis: AtomicI64::new(0),
            semantic_patch: AtomicU64::new(0),
            last_version: Mutex::new(None),
        }
    }

    pub fn strategy(&self) -> VersionStrategy {
        self.strategy
    }

    /// Create the next version for `content`.
    pub fn create(
        &self,
        content: &Value,
        tags: &[String],
        metadata: Map<String, Value>,
        now: OffsetDateTime,
    ) -> CacheVersion {
        let checksum = content_digest(content);
        let version = match self.strategy {
            VersionStrategy::Timestamp => self.next_millis(now).to_string(),
            VersionStrategy::Semantic => {
                let patch = self.semantic_patch.fetch_add(1, AtomicOrdering::SeqCst);
                format!("1.0.{patch}")
            }
            VersionStrategy::Hash => checksum[..HASH_VERSION_LEN].to_string(),
            VersionStrategy::Hybrid => {
                format!("{}-{}", self.next_millis(now), &checksum[..HYBRID_HASH_LEN])
            }
        };

        let parent_version = mutex_lock(&self.last_version, SOURCE, "create").replace(version.clone());

        CacheVersion {
            version,
            created_at: now,
            checksum,
            tags: tags.to_vec(),
            parent_version,
            metadata,
        }
    }

    /// Compare two versions under this generator's strategy.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        compare_versions(self.strategy, a, b)
    }

    /// True when `candidate` is not older than `minimum`.
    pub fn is_valid(&self, candidate: &str, minimum: &str) -> bool {
        self.compare(candidate, minimum) != Ordering::Less
    }

    /// Strictly increasing millisecond stamp, even when the clock stalls or steps back.
    fn next_millis(&self, now: OffsetDateTime) -> i64 {
        let wall = unix_millis(now);
        let mut last = self.last_millis.load(AtomicOrdering::SeqCst);
        loop {
            let candidate = wall.max(last + 1);
            match self.last_millis.compare_exchange(
                last,
                candidate,
                AtomicOrdering::SeqCst,
                AtomicOrdering::SeqCst,
            ) {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }
}

impl fmt::Debug for VersionGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionGenerator")
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Strategy-consistent comparison of two version strings.
pub fn compare_versions(strategy: VersionStrategy, a: &str, b: &str) -> Ordering {
    match strategy {
        VersionStrategy::Timestamp => match (a.parse::<i128>(), b.parse::<i128>()) {
            (Ok(left), Ok(right)) => left.cmp(&right),
            _ => a.cmp(b),
        },
        VersionStrategy::Semantic => compare_dotted(a, b),
        VersionStrategy::Hash => a.cmp(b),
        VersionStrategy::Hybrid => {
            let left = a.split_once('-').map_or(a, |(stamp, _)| stamp).parse::<i128>();
            let right = b.split_once('-').map_or(b, |(stamp, _)| stamp).parse::<i128>();
            match (left, right) {
                (Ok(left), Ok(right)) => left.cmp(&right).then_with(|| a.cmp(b)),
                _ => a.cmp(b),
            }
        }
    }
}

fn compare_dotted(a: &str, b: &str) -> Ordering {
    let left: Vec<u64> = a.split('.').map(|part| part.parse().unwrap_or(0)).collect();
    let right: Vec<u64> = b.split('.').map(|part| part.parse().unwrap_or(0)).collect();
    let len = left.len().max(right.len());
    (0..len)
        .map(|idx| {
            let l = left.get(idx).copied().unwrap_or(0);
            let r = right.get(idx).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// SHA-256 of the JSON serialization. Object keys serialize in sorted order,
/// so equal values always digest equally.
pub fn content_digest(content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}
