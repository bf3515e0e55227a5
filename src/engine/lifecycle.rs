//! Reservation Lifecycle Manager: create, move/resize, register attendance, cancel.

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::capacity::{check_capacity, validate_interval};
use super::ledger::ensure_credit;
use super::{Engine, EngineError};

/// Result of registering attendance on a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceOutcome {
    pub reservation: Reservation,
    /// Credit left on the linked pass after this attendance, if a pass is linked.
    pub remaining_sessions: Option<u32>,
    /// Set when attendance was recorded without taking credit: the linked pass
    /// had none left or no longer exists.
    pub warning: Option<EngineError>,
}

fn rejected(err: EngineError) -> EngineError {
    metrics::counter!(
        crate::observability::RESERVATIONS_REJECTED_TOTAL,
        "reason" => err.reason()
    )
    .increment(1);
    err
}

impl Engine {
    /// Book `[start, end)` on a space for a client. The capacity gate and the
    /// insert run under the space's write lock, so concurrent bookings for the
    /// same space cannot both take the last slot.
    pub async fn create_reservation(
        &self,
        client_id: String,
        space_id: Ulid,
        start: Ms,
        end: Ms,
        pass_id: Option<Ulid>,
    ) -> Result<Reservation, EngineError> {
        let span = validate_interval(start, end).map_err(rejected)?;
        let now = self.now();
        if start <= now {
            return Err(rejected(EngineError::PastStartTime { start, now }));
        }
        if client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(EngineError::LimitExceeded("client id too long"));
        }

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_space(&space_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
            return Err(EngineError::LimitExceeded("too many reservations on space"));
        }
        if let Err(e) = check_capacity(&guard, &span, None) {
            tracing::debug!("space {space_id}: rejected [{start}, {end}): {e}");
            return Err(rejected(e));
        }
        if let Some(pid) = pass_id {
            let pass = self.lock_pass(&pid).await.map_err(|e| match e {
                EngineError::PassNotFound(_) => rejected(e),
                other => other,
            })?;
            ensure_credit(&pass).map_err(rejected)?;
        }

        let id = Ulid::new();
        let event = Event::ReservationCreated {
            id,
            space_id,
            client_id,
            span,
            pass_id,
            created_at: now,
        };
        self.persist_space(&mut guard, &event).await?;
        tracing::info!("space {space_id}: reservation {id} booked [{start}, {end})");
        guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Reschedule a reservation to `[start, end)` on the same space. The
    /// reservation does not count against itself.
    pub async fn move_reservation(
        &self,
        id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let span = validate_interval(start, end).map_err(rejected)?;

        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let current = guard
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !current.is_confirmed() {
            return Err(EngineError::ReservationCancelled(id));
        }
        if current.span == span {
            return Ok(current.clone());
        }
        if let Err(e) = check_capacity(&guard, &span, Some(id)) {
            tracing::debug!("reservation {id}: move to [{start}, {end}) rejected: {e}");
            return Err(rejected(e));
        }

        let event = Event::ReservationMoved {
            id,
            space_id: guard.id,
            span,
        };
        self.persist_space(&mut guard, &event).await?;
        tracing::info!("reservation {id} moved to [{start}, {end})");
        guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Mark a reservation as attended. A linked pass gives up one credit in
    /// the same commit. An exhausted or deleted pass does not block the
    /// attendance; the outcome carries a `PassExhausted` or `PassNotFound`
    /// warning instead.
    pub async fn register_attendance(&self, id: Ulid) -> Result<AttendanceOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut space = self.resolve_reservation_write(&id).await?;
        let current = space
            .reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !current.is_confirmed() {
            return Err(EngineError::ReservationCancelled(id));
        }
        if current.attendance_registered {
            return Err(EngineError::AlreadyAttended(id));
        }
        let pass_id = current.pass_id;

        // Space lock is already held; the pass lock always comes second.
        // A pass deleted since booking leaves the attendance creditless.
        let mut warning = None;
        let mut pass = match pass_id {
            Some(pid) => match self.lock_pass(&pid).await {
                Ok(guard) => Some(guard),
                Err(e @ EngineError::PassNotFound(_)) => {
                    warning = Some(e);
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let now = self.now();
        let credit = match pass.as_deref() {
            Some(ps) => match ensure_credit(ps) {
                Ok(()) => Some(CreditUse {
                    pass_id: ps.pass.id,
                    entry_id: Ulid::new(),
                    date: now,
                }),
                Err(e) => {
                    warning = Some(e);
                    None
                }
            },
            None => None,
        };

        let event = Event::AttendanceRegistered {
            id,
            space_id: space.id,
            credit,
        };
        self.persist_space_and_pass(&mut space, pass.as_deref_mut(), &event)
            .await?;

        if let Some(w) = &warning {
            metrics::counter!(crate::observability::ATTENDANCE_WARNINGS_TOTAL).increment(1);
            tracing::warn!("reservation {id}: attendance recorded but {w}");
        } else {
            tracing::info!("reservation {id}: attendance registered");
        }

        let reservation = space
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        Ok(AttendanceOutcome {
            reservation,
            remaining_sessions: pass.as_ref().map(|ps| ps.pass.remaining_sessions),
            warning,
        })
    }

    /// Soft-cancel a reservation. Pass credit is never touched; cancelling an
    /// already cancelled reservation succeeds without writing anything.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.resolve_reservation_write(&id).await?;
        let confirmed = guard
            .reservation(&id)
            .map(|r| r.is_confirmed())
            .ok_or(EngineError::ReservationNotFound(id))?;
        if !confirmed {
            return Ok(());
        }

        let event = Event::ReservationCancelled {
            id,
            space_id: guard.id,
        };
        self.persist_space(&mut guard, &event).await?;
        tracing::info!("reservation {id} cancelled");
        Ok(())
    }
}
