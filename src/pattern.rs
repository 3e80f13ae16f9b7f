//! Key patterns shared by invalidation rules, intents, and layers.

use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid key pattern `{pattern}`: {source}")]
pub struct PatternError {
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Matches cache keys or dependency ids either by substring containment or by regex.
///
/// The textual form `/expr/` selects a regex; anything else is a literal substring.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Contains(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn contains(needle: impl Into<String>) -> Self {
        Self::Contains(needle.into())
    }

    pub fn regex(expr: &str) -> Result<Self, PatternError> {
        Regex::new(expr)
            .map(Self::Regex)
            .map_err(|source| PatternError {
                pattern: expr.to_string(),
                source,
            })
    }

    /// Parse the textual form used in configuration and invalidation events.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        match raw.strip_prefix('/').and_then(|rest| rest.strip_suffix('/')) {
            Some(expr) => Self::regex(expr),
            None => Ok(Self::contains(raw)),
        }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            Self::Contains(needle) => candidate.contains(needle.as_str()),
            Self::Regex(regex) => regex.is_match(candidate),
        }
    }

    /// True if any element of `candidates` matches.
    pub fn matches_any<'a>(&self, candidates: impl IntoIterator<Item = &'a str>) -> bool {
        candidates.into_iter().any(|candidate| self.matches(candidate))
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains(needle) => f.write_str(needle),
            Self::Regex(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Contains(a), Self::Contains(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for KeyPattern {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_matches_by_containment() {
        let pattern = KeyPattern::parse("content:").expect("literal parses");
        assert!(pattern.matches("content:hero"));
        assert!(!pattern.matches("page:home"));
    }

    #[test]
    fn slashes_select_regex() {
        let pattern = KeyPattern::parse("/^page:(home|about)$/").expect("regex parses");
        assert!(matches!(pattern, KeyPattern::Regex(_)));
        assert!(pattern.matches("page:home"));
        assert!(!pattern.matches("page:homepage"));
    }

    #[test]
    fn bad_regex_is_reported() {
        let err = KeyPattern::parse("/(unclosed/").expect_err("regex should fail");
        assert_eq!(err.pattern, "(unclosed");
    }

    #[test]
    fn lone_slash_is_literal() {
        let pattern = KeyPattern::parse("/").expect("literal parses");
        assert_eq!(pattern, KeyPattern::contains("/"));
    }

    #[test]
    fn display_round_trips_textual_form() {
        let pattern = KeyPattern::parse("/^a.b$/").expect("regex parses");
        assert_eq!(pattern.to_string(), "/^a.b$/");
        assert_eq!(KeyPattern::parse(&pattern.to_string()).expect("reparse"), pattern);
    }
}
