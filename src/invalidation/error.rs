use thiserror::Error;
use uuid::Uuid;

use crate::pattern::PatternError;

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("invalidation event {event_id} has an empty target")]
    EmptyTarget { event_id: Uuid },
    #[error(transparent)]
    InvalidPattern(#[from] PatternError),
    #[error("queue `{queue}` full, {dropped} intents dropped")]
    QueueFull { queue: &'static str, dropped: usize },
}
