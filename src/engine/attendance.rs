//! Attendance Log: the per-pass list of attended dates.

use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Log an attendance on `date` directly against a pass, consuming one
    /// credit. An exhausted pass rejects the entry.
    pub async fn append_attendance(&self, pass_id: Ulid, date: Ms) -> Result<Ulid, EngineError> {
        Ok(self.consume_credit(pass_id, date).await?.entry_id)
    }

    /// Delete an entry and give its credit back to the pass.
    pub async fn remove_attendance(
        &self,
        pass_id: Ulid,
        entry_id: Ulid,
    ) -> Result<SessionPass, EngineError> {
        self.restore_credit(pass_id, entry_id).await
    }

    /// Delete an entry knowing only its id.
    pub async fn remove_attendance_entry(&self, entry_id: Ulid) -> Result<SessionPass, EngineError> {
        let pass_id = self
            .pass_for_entry(&entry_id)
            .ok_or(EngineError::AttendanceNotFound(entry_id))?;
        self.remove_attendance(pass_id, entry_id).await
    }

    /// Re-date an entry knowing only its id.
    pub async fn edit_attendance_entry(
        &self,
        entry_id: Ulid,
        date: Ms,
    ) -> Result<AttendanceEntry, EngineError> {
        let pass_id = self
            .pass_for_entry(&entry_id)
            .ok_or(EngineError::AttendanceNotFound(entry_id))?;
        self.edit_attendance_date(pass_id, entry_id, date).await
    }

    /// Entries of a pass in chronological order, oldest or newest first.
    pub async fn list_attendance(
        &self,
        pass_id: Ulid,
        order: AttendanceOrder,
    ) -> Result<Vec<AttendanceEntry>, EngineError> {
        let ps = self
            .get_pass(&pass_id)
            .ok_or(EngineError::PassNotFound(pass_id))?;
        let guard = ps.read().await;
        let mut entries = guard.entries.clone();
        if order == AttendanceOrder::Newest {
            entries.reverse();
        }
        Ok(entries)
    }

    pub async fn get_attendance(&self, entry_id: Ulid) -> Option<AttendanceEntry> {
        let pass_id = self.pass_for_entry(&entry_id)?;
        let ps = self.get_pass(&pass_id)?;
        let guard = ps.read().await;
        guard.entry(&entry_id).cloned()
    }
}
