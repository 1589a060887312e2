// Error taxonomy for the arena core.

use crate::models::HotStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed caller input. Nothing is persisted.
    #[error("{0}")]
    Validation(String),

    /// Unknown or stale match/round/submission/user reference.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A judge callback referenced a task token the aggregate has moved
    /// past (rejudge, resubmit). Routine under at-least-once delivery;
    /// callers log and drop it.
    #[error("task token does not match")]
    TaskTokenMismatch,

    /// Submission refused by policy. Carries the structured reason for
    /// UI display; any non-cold status is a hard rejection.
    #[error("submission rejected: {0:?}")]
    SubmitRejected(HotStatus),

    /// Optimistic-concurrency retries exhausted.
    #[error("conflicting concurrent update, retries exhausted")]
    Conflict,

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
