use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::overlap::count_overlapping;
use super::{Engine, EngineError};

/// True iff one more reservation on `span` keeps the space within capacity.
pub fn admits(ss: &SpaceState, span: &Span, exclude: Option<Ulid>) -> bool {
    (count_overlapping(ss, span, exclude) as u64) < u64::from(ss.capacity)
}

/// Capacity gate used inside write transactions: the caller holds the space
/// write lock until the reservation it admits is committed.
pub(crate) fn check_capacity(
    ss: &SpaceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let overlapping = count_overlapping(ss, span, exclude);
    if (overlapping as u64) < u64::from(ss.capacity) {
        Ok(())
    } else {
        Err(EngineError::SpaceFull {
            space_id: ss.id,
            capacity: ss.capacity,
            overlapping,
        })
    }
}

pub(crate) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `start < end`, inside the valid timestamp range and not absurdly long.
pub(crate) fn validate_interval(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(span)
}

/// Query window bounds: ordered, inside the valid timestamp range and no
/// wider than `MAX_QUERY_WINDOW_MS`.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval { start, end });
    }
    validate_timestamp(start)?;
    validate_timestamp(end)?;
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

impl Engine {
    /// Would the space accept one more reservation on `[start, end)` right now?
    /// Advisory only; create and move re-run the gate under the space lock.
    pub async fn can_admit(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        Ok(self.occupancy(space_id, start, end, exclude).await?.admits)
    }

    pub async fn occupancy(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Occupancy, EngineError> {
        let span = validate_window(start, end)?;
        let ss = self
            .get_space(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let guard = ss.read().await;
        Ok(Occupancy {
            space_id,
            capacity: guard.capacity,
            overlapping: count_overlapping(&guard, &span, exclude),
            admits: admits(&guard, &span, exclude),
        })
    }
}
