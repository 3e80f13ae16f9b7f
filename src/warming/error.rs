use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WarmingError {
    #[error("warming session {active} is already running")]
    SessionAlreadyActive { active: Uuid },
    #[error("unknown warming target `{0}`")]
    UnknownTarget(String),
}

/// Why a single target did not produce a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch failed: {0}")]
    Failed(String),
    #[error("fetch timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
    #[error("value rejected by validator")]
    ValidationFailed,
}

impl FetchError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
