use thiserror::Error;
use ulid::Ulid;

/// Every failure the engine reports. Nothing is logged or swallowed inside the
/// engine; callers decide how to present these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Malformed or out-of-range input. Fix the input; never retried.
    #[error("invalid input: {0}")]
    Validation(String),
    /// The referenced vehicle or booking does not exist.
    #[error("not found: {0}")]
    NotFound(Ulid),
    /// The candidate window overlaps the given existing reservation.
    #[error("vehicle is already booked for this time slot (conflicts with {0})")]
    Conflict(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// The write-ahead log rejected the change; nothing was applied.
    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short stable label, used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Storage(_) => "storage",
        }
    }
}
