use ulid::Ulid;

use crate::model::ScheduleStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The slot is (or just became) booked. Distinct from every other
    /// failure so clients can refresh availability instead of retrying.
    AlreadyBooked(Ulid),
    SlotInPast(Ulid),
    /// Bounded lock retry exhausted under contention.
    Contended(Ulid),
    Validation(&'static str),
    Forbidden(&'static str),
    InvalidTransition {
        from: ScheduleStatus,
        to: ScheduleStatus,
    },
    LimitExceeded(&'static str),
    Wal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::AlreadyBooked(id) => write!(f, "slot already booked: {id}"),
            EngineError::SlotInPast(id) => write!(f, "slot is in the past: {id}"),
            EngineError::Contended(id) => write!(f, "slot contended, try again: {id}"),
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(
                    f,
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    to.as_str()
                )
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
