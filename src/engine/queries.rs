use ulid::Ulid;

use crate::model::*;

use super::capacity::validate_window;
use super::{Engine, EngineError};

impl Engine {
    /// All spaces, ordered by id (creation order).
    pub async fn list_spaces(&self) -> Vec<Space> {
        let states: Vec<_> = self.spaces.iter().map(|e| e.value().clone()).collect();
        let mut spaces = Vec::with_capacity(states.len());
        for ss in states {
            spaces.push(ss.read().await.info());
        }
        spaces.sort_by_key(|s| s.id);
        spaces
    }

    pub async fn space_info(&self, id: Ulid) -> Result<Space, EngineError> {
        let ss = self.get_space(&id).ok_or(EngineError::SpaceNotFound(id))?;
        let guard = ss.read().await;
        Ok(guard.info())
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let space_id = self
            .space_for_reservation(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let ss = self
            .get_space(&space_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = ss.read().await;
        guard
            .reservation(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Reservations on a space ordered by start, optionally limited to those
    /// overlapping `window`. Cancelled ones are skipped unless asked for.
    pub async fn reservations_for_space(
        &self,
        space_id: Ulid,
        window: Option<Span>,
        include_cancelled: bool,
    ) -> Result<Vec<Reservation>, EngineError> {
        if let Some(w) = window {
            validate_window(w.start, w.end)?;
        }
        let ss = self
            .get_space(&space_id)
            .ok_or(EngineError::SpaceNotFound(space_id))?;
        let guard = ss.read().await;
        let keep = |r: &&Reservation| include_cancelled || r.is_confirmed();
        Ok(match window {
            Some(w) => guard.overlapping(&w).filter(keep).cloned().collect(),
            None => guard.reservations.iter().filter(keep).cloned().collect(),
        })
    }

    /// Every reservation a client holds across all spaces, ordered by start.
    pub async fn reservations_for_client(
        &self,
        client_id: &str,
        include_cancelled: bool,
    ) -> Vec<Reservation> {
        let states: Vec<_> = self.spaces.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ss in states {
            let guard = ss.read().await;
            out.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.client_id == client_id)
                    .filter(|r| include_cancelled || r.is_confirmed())
                    .cloned(),
            );
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub async fn pass_info(&self, id: Ulid) -> Result<SessionPass, EngineError> {
        let ps = self.get_pass(&id).ok_or(EngineError::PassNotFound(id))?;
        let guard = ps.read().await;
        Ok(guard.pass.clone())
    }

    /// Passes issued to a client, oldest first.
    pub async fn passes_for_client(&self, client_id: &str) -> Vec<SessionPass> {
        self.collect_passes(|p| p.client_id == client_id).await
    }

    /// Passes with credit left.
    pub async fn active_passes(&self) -> Vec<SessionPass> {
        self.collect_passes(|p| p.remaining_sessions > 0).await
    }

    pub async fn list_passes(&self) -> Vec<SessionPass> {
        self.collect_passes(|_| true).await
    }

    async fn collect_passes(&self, pred: impl Fn(&SessionPass) -> bool) -> Vec<SessionPass> {
        let states: Vec<_> = self.passes.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ps in states {
            let guard = ps.read().await;
            if pred(&guard.pass) {
                out.push(guard.pass.clone());
            }
        }
        out.sort_by_key(|p| (p.issued_at, p.id));
        out
    }
}
