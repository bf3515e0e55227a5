use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `start >= end`.
    InvalidInterval { start: Ms, end: Ms },
    /// Creation requires a start strictly after the current time.
    PastStartTime { start: Ms, now: Ms },
    SpaceNotFound(Ulid),
    /// Admitting the interval would exceed the space's concurrent capacity.
    SpaceFull { space_id: Ulid, capacity: u32, overlapping: usize },
    PassNotFound(Ulid),
    PassExhausted(Ulid),
    ReservationNotFound(Ulid),
    ReservationCancelled(Ulid),
    AlreadyAttended(Ulid),
    AttendanceNotFound(Ulid),
    /// Lock contention outlasted every retry.
    ConcurrentConflict,
    InvalidCapacity(u32),
    InvalidPass(&'static str),
    /// A space with confirmed reservations that have not ended cannot be deleted.
    SpaceInUse { space_id: Ulid, live_reservations: usize },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Short machine-readable reason, used for metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. } => "invalid_interval",
            EngineError::PastStartTime { .. } => "past_start_time",
            EngineError::SpaceNotFound(_) => "space_not_found",
            EngineError::SpaceFull { .. } => "space_full",
            EngineError::PassNotFound(_) => "pass_not_found",
            EngineError::PassExhausted(_) => "pass_exhausted",
            EngineError::ReservationNotFound(_) => "reservation_not_found",
            EngineError::ReservationCancelled(_) => "reservation_cancelled",
            EngineError::AlreadyAttended(_) => "already_attended",
            EngineError::AttendanceNotFound(_) => "attendance_not_found",
            EngineError::ConcurrentConflict => "concurrent_conflict",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::InvalidPass(_) => "invalid_pass",
            EngineError::SpaceInUse { .. } => "space_in_use",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}): start must be before end")
            }
            EngineError::PastStartTime { start, now } => {
                write!(f, "start time {start} is not after the current time {now}")
            }
            EngineError::SpaceNotFound(id) => write!(f, "space not found: {id}"),
            EngineError::SpaceFull {
                space_id,
                capacity,
                overlapping,
            } => write!(
                f,
                "space {space_id} is full: {overlapping} overlapping reservations, capacity {capacity}"
            ),
            EngineError::PassNotFound(id) => write!(f, "pass not found: {id}"),
            EngineError::PassExhausted(id) => write!(f, "pass {id} has no remaining sessions"),
            EngineError::ReservationNotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::ReservationCancelled(id) => write!(f, "reservation {id} is cancelled"),
            EngineError::AlreadyAttended(id) => {
                write!(f, "attendance already registered for reservation {id}")
            }
            EngineError::AttendanceNotFound(id) => write!(f, "attendance entry not found: {id}"),
            EngineError::ConcurrentConflict => {
                write!(f, "concurrent conflict: record busy, retries exhausted")
            }
            EngineError::InvalidCapacity(cap) => write!(f, "invalid capacity {cap}: must be positive"),
            EngineError::InvalidPass(msg) => write!(f, "invalid pass: {msg}"),
            EngineError::SpaceInUse {
                space_id,
                live_reservations,
            } => write!(
                f,
                "cannot delete space {space_id}: {live_reservations} live reservations"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
