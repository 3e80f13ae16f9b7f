//! Warming session lifecycle.

use std::fmt;

use time::OffsetDateTime;
use uuid::Uuid;

use super::error::FetchError;
use super::strategy::WarmingStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ConditionUnmet,
    TimeBudget,
    MemoryBudget,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConditionUnmet => "condition_unmet",
            Self::TimeBudget => "time_budget",
            Self::MemoryBudget => "memory_budget",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TargetOutcome {
    Completed { bytes: usize },
    Failed(FetchError),
    Skipped(SkipReason),
}

impl TargetOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed(_) => "failed",
            Self::Skipped(_) => "skipped",
        }
    }
}

/// One run of the warming executor. Never mutated once terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct WarmingSession {
    pub id: Uuid,
    pub strategy: WarmingStrategy,
    pub state: SessionState,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    /// Target ids in execution order.
    pub targets: Vec<String>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub fetched_bytes: usize,
    pub error: Option<String>,
}

impl WarmingSession {
    pub(crate) fn new(id: Uuid, strategy: WarmingStrategy, started_at: OffsetDateTime) -> Self {
        Self {
            id,
            strategy,
            state: SessionState::Created,
            started_at,
            ended_at: None,
            targets: Vec::new(),
            completed: 0,
            failed: 0,
            skipped: 0,
            fetched_bytes: 0,
            error: None,
        }
    }

    pub(crate) fn start(&mut self, targets: Vec<String>) {
        if self.state == SessionState::Created {
            self.targets = targets;
            self.state = SessionState::Running;
        }
    }

    pub(crate) fn record(&mut self, outcome: &TargetOutcome) {
        if self.state.is_terminal() {
            return;
        }
        match outcome {
            TargetOutcome::Completed { bytes } => {
                self.completed += 1;
                self.fetched_bytes += bytes;
            }
            TargetOutcome::Failed(_) => self.failed += 1,
            TargetOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub(crate) fn complete(&mut self, at: OffsetDateTime) {
        if !self.state.is_terminal() {
            self.state = SessionState::Completed;
            self.ended_at = Some(at);
        }
    }

    pub(crate) fn fail(&mut self, at: OffsetDateTime, error: impl Into<String>) {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
            self.ended_at = Some(at);
            self.error = Some(error.into());
        }
    }

    pub fn duration(&self) -> Option<time::Duration> {
        self.ended_at.map(|ended| ended - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn lifecycle_is_terminal_once_ended() {
        let mut session = WarmingSession::new(
            Uuid::new_v4(),
            WarmingStrategy::Critical,
            datetime!(2024-05-01 10:00 UTC),
        );
        session.start(vec!["a".to_string()]);
        assert_eq!(session.state, SessionState::Running);

        session.record(&TargetOutcome::Completed { bytes: 12 });
        session.record(&TargetOutcome::Skipped(SkipReason::ConditionUnmet));
        session.complete(datetime!(2024-05-01 10:00:02 UTC));

        session.record(&TargetOutcome::Failed(FetchError::failed("late")));
        session.fail(datetime!(2024-05-01 10:01 UTC), "late");

        assert_eq!(session.state, SessionState::Completed);
        assert_eq!((session.completed, session.failed, session.skipped), (1, 0, 1));
        assert_eq!(session.fetched_bytes, 12);
        assert_eq!(session.duration(), Some(time::Duration::seconds(2)));
        assert!(session.error.is_none());
    }
}
