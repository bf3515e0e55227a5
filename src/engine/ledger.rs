//! Session Pass Ledger: remaining credit and last-attendance time of a pass.
//!
//! Credit only moves together with the attendance log. A consumed credit is
//! always a new entry and a restored credit is always a removed entry, both
//! carried by one WAL event, so `remaining = total - entries` holds after
//! every commit and after replay.

use ulid::Ulid;

use crate::model::*;

use super::capacity::validate_timestamp;
use super::{Engine, EngineError};

/// Result of consuming one credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreditReceipt {
    pub entry_id: Ulid,
    pub remaining_sessions: u32,
}

pub(crate) fn ensure_credit(ps: &PassState) -> Result<(), EngineError> {
    if ps.pass.remaining_sessions == 0 {
        return Err(EngineError::PassExhausted(ps.pass.id));
    }
    Ok(())
}

fn recompute_last_attendance(ps: &mut PassState) {
    ps.pass.last_attendance_time = ps.latest_entry_date();
}

pub(crate) fn apply_consume(ps: &mut PassState, entry: AttendanceEntry) {
    ps.pass.remaining_sessions = ps.pass.remaining_sessions.saturating_sub(1);
    ps.insert_entry(entry);
    recompute_last_attendance(ps);
}

pub(crate) fn apply_restore(ps: &mut PassState, entry_id: Ulid) -> Option<AttendanceEntry> {
    let removed = ps.remove_entry(entry_id)?;
    ps.pass.remaining_sessions = (ps.pass.remaining_sessions + 1).min(ps.pass.total_sessions);
    recompute_last_attendance(ps);
    Some(removed)
}

pub(crate) fn apply_edit(ps: &mut PassState, entry_id: Ulid, date: Ms) {
    if let Some(mut entry) = ps.remove_entry(entry_id) {
        entry.date = date;
        ps.insert_entry(entry);
    }
    recompute_last_attendance(ps);
}

impl Engine {
    /// Consume one credit of `pass_id`, logging an attendance on `date`.
    /// Fails with `PassExhausted` when nothing is left; the caller decides
    /// whether that is fatal.
    pub async fn consume_credit(
        &self,
        pass_id: Ulid,
        date: Ms,
    ) -> Result<CreditReceipt, EngineError> {
        validate_timestamp(date)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_pass(&pass_id).await?;
        ensure_credit(&guard)?;

        let entry_id = Ulid::new();
        let event = Event::AttendanceAppended {
            pass_id,
            entry_id,
            date,
            reservation_id: None,
        };
        self.persist_pass(&mut guard, &event).await?;
        tracing::info!(
            "pass {pass_id}: credit consumed, {} remaining",
            guard.pass.remaining_sessions
        );
        Ok(CreditReceipt {
            entry_id,
            remaining_sessions: guard.pass.remaining_sessions,
        })
    }

    /// Give back the credit held by `entry_id` and drop the entry.
    /// `last_attendance_time` falls back to the newest remaining entry.
    pub async fn restore_credit(
        &self,
        pass_id: Ulid,
        entry_id: Ulid,
    ) -> Result<SessionPass, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_pass(&pass_id).await?;
        if guard.entry(&entry_id).is_none() {
            return Err(EngineError::AttendanceNotFound(entry_id));
        }

        let event = Event::AttendanceRemoved { pass_id, entry_id };
        self.persist_pass(&mut guard, &event).await?;
        tracing::info!(
            "pass {pass_id}: attendance {entry_id} removed, {} remaining",
            guard.pass.remaining_sessions
        );
        Ok(guard.pass.clone())
    }

    /// Rewrite the date of an entry. Remaining credit is untouched.
    pub async fn edit_attendance_date(
        &self,
        pass_id: Ulid,
        entry_id: Ulid,
        date: Ms,
    ) -> Result<AttendanceEntry, EngineError> {
        validate_timestamp(date)?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_pass(&pass_id).await?;
        if guard.entry(&entry_id).is_none() {
            return Err(EngineError::AttendanceNotFound(entry_id));
        }

        let event = Event::AttendanceEdited {
            pass_id,
            entry_id,
            date,
        };
        self.persist_pass(&mut guard, &event).await?;
        guard
            .entry(&entry_id)
            .cloned()
            .ok_or(EngineError::AttendanceNotFound(entry_id))
    }
}
