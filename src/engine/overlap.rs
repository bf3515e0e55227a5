use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Number of confirmed reservations on `ss` overlapping `span`, not counting `exclude`.
///
/// Overlap is strict half-open: `[9, 10)` and `[10, 11)` do not overlap.
pub fn count_overlapping(ss: &SpaceState, span: &Span, exclude: Option<Ulid>) -> usize {
    ss.overlapping(span)
        .filter(|r| r.is_confirmed() && Some(r.id) != exclude)
        .count()
}

impl Engine {
    /// Point-in-time overlap count for a space. Read-only.
    pub async fn count_overlapping(
        &self,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<usize, EngineError> {
        if start >= end {
            return Err(EngineError::InvalidInterval { start, end });
        }
        let ss = self
            .get_space(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let guard = ss.read().await;
        Ok(count_overlapping(&guard, &Span::new(start, end), exclude))
    }
}
