//! Administration of the records the engine reads: spaces and passes.
//! Also WAL compaction, which needs a consistent view of both.

use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{pass_from_issued, Engine, EngineError, WalCommand};

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_new_pass(new: &NewPass) -> Result<(), EngineError> {
    if new.client_id.is_empty() {
        return Err(EngineError::InvalidPass("client id is required"));
    }
    if new.client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(EngineError::LimitExceeded("client id too long"));
    }
    if new.total_sessions == 0 {
        return Err(EngineError::InvalidPass("total sessions must be positive"));
    }
    if new.total_sessions > MAX_SESSIONS_PER_PASS {
        return Err(EngineError::LimitExceeded("too many sessions on pass"));
    }
    if new.session_duration_minutes == 0 {
        return Err(EngineError::InvalidPass("session duration must be positive"));
    }
    if new.session_duration_minutes > MAX_SESSION_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("session duration too long"));
    }
    if new.trainers.len() > MAX_TRAINERS_PER_PASS {
        return Err(EngineError::LimitExceeded("too many trainers on pass"));
    }
    for trainer in &new.trainers {
        validate_name(trainer)?;
    }
    Ok(())
}

impl Engine {
    pub async fn create_space(&self, name: String, capacity: u32) -> Result<Space, EngineError> {
        if capacity == 0 {
            return Err(EngineError::InvalidCapacity(capacity));
        }
        validate_name(&name)?;
        if self.spaces.len() >= MAX_SPACES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many spaces"));
        }

        let _gate = self.commit_gate.read().await;
        let id = Ulid::new();
        let event = Event::SpaceCreated {
            id,
            name: name.clone(),
            capacity,
        };
        self.wal_append(&event).await?;
        let ss = SpaceState::new(id, name, capacity);
        let info = ss.info();
        self.spaces.insert(id, Arc::new(RwLock::new(ss)));
        self.notify.send(id, &event);
        tracing::info!("space {id} created with capacity {capacity}");
        Ok(info)
    }

    /// Rename and/or resize a space. A capacity change only affects later
    /// admission checks; existing reservations are kept even above the new limit.
    pub async fn update_space(
        &self,
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
    ) -> Result<Space, EngineError> {
        if let Some(cap) = capacity
            && cap == 0
        {
            return Err(EngineError::InvalidCapacity(cap));
        }
        if let Some(n) = &name {
            validate_name(n)?;
        }

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_space(&id).await?;
        let event = Event::SpaceUpdated {
            id,
            name: name.unwrap_or_else(|| guard.name.clone()),
            capacity: capacity.unwrap_or(guard.capacity),
        };
        self.persist_space(&mut guard, &event).await?;
        tracing::info!("space {id} updated: capacity {}", guard.capacity);
        Ok(guard.info())
    }

    /// Delete a space and its reservation history. Refused while confirmed
    /// reservations that have not ended yet remain.
    pub async fn delete_space(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = self.lock_space(&id).await?;
        let now = self.now();
        let live_reservations = guard
            .reservations
            .iter()
            .filter(|r| r.is_confirmed() && r.span.end > now)
            .count();
        if live_reservations > 0 {
            return Err(EngineError::SpaceInUse {
                space_id: id,
                live_reservations,
            });
        }

        let event = Event::SpaceDeleted { id };
        self.wal_append(&event).await?;
        self.spaces.remove(&id);
        for r in &guard.reservations {
            self.reservation_to_space.remove(&r.id);
        }
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!("space {id} deleted");
        Ok(())
    }

    pub async fn issue_pass(&self, new: NewPass) -> Result<SessionPass, EngineError> {
        validate_new_pass(&new)?;
        if self.passes.len() >= MAX_PASSES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many passes"));
        }

        let _gate = self.commit_gate.read().await;
        let id = Ulid::new();
        let event = Event::PassIssued {
            id,
            client_id: new.client_id,
            kind: new.kind,
            total_sessions: new.total_sessions,
            session_duration_minutes: new.session_duration_minutes,
            payment_status: new.payment_status,
            trainers: new.trainers,
            issued_at: self.now(),
        };
        let pass = pass_from_issued(&event).ok_or(EngineError::PassNotFound(id))?;
        self.wal_append(&event).await?;
        self.passes
            .insert(id, Arc::new(RwLock::new(PassState::new(pass.clone()))));
        self.notify.send(id, &event);
        tracing::info!(
            "pass {id} issued to {}: {} sessions",
            pass.client_id,
            pass.total_sessions
        );
        Ok(pass)
    }

    pub async fn set_payment_status(
        &self,
        id: Ulid,
        payment_status: PaymentStatus,
    ) -> Result<SessionPass, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_pass(&id).await?;
        if guard.pass.payment_status != payment_status {
            let event = Event::PaymentStatusChanged { id, payment_status };
            self.persist_pass(&mut guard, &event).await?;
            tracing::info!("pass {id} marked {}", payment_status.as_str());
        }
        Ok(guard.pass.clone())
    }

    /// Delete a pass along with its attendance log. Reservations that linked
    /// it keep the dangling reference; attending them fails with `PassNotFound`.
    pub async fn delete_pass(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let guard = self.lock_pass(&id).await?;
        let event = Event::PassDeleted { id };
        self.wal_append(&event).await?;
        self.passes.remove(&id);
        for e in &guard.entries {
            self.entry_to_pass.remove(&e.id);
        }
        self.notify.send(id, &event);
        self.notify.remove(&id);
        tracing::info!("pass {id} deleted");
        Ok(())
    }

    /// Rewrite the WAL with the minimal event set for the current state.
    /// Holds the commit gate exclusively, so no mutation commits meanwhile.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let spaces: Vec<_> = self.spaces.iter().map(|e| e.value().clone()).collect();
        for ss in spaces {
            let guard = ss.read().await;
            events.push(Event::SpaceCreated {
                id: guard.id,
                name: guard.name.clone(),
                capacity: guard.capacity,
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    space_id: r.space_id,
                    client_id: r.client_id.clone(),
                    span: r.span,
                    pass_id: r.pass_id,
                    created_at: r.created_at,
                });
                if r.attendance_registered {
                    events.push(Event::AttendanceRegistered {
                        id: r.id,
                        space_id: r.space_id,
                        credit: None,
                    });
                }
                if !r.is_confirmed() {
                    events.push(Event::ReservationCancelled {
                        id: r.id,
                        space_id: r.space_id,
                    });
                }
            }
        }

        let passes: Vec<_> = self.passes.iter().map(|e| e.value().clone()).collect();
        for ps in passes {
            let guard = ps.read().await;
            let pass = &guard.pass;
            events.push(Event::PassIssued {
                id: pass.id,
                client_id: pass.client_id.clone(),
                kind: pass.kind,
                total_sessions: pass.total_sessions,
                session_duration_minutes: pass.session_duration_minutes,
                payment_status: pass.payment_status,
                trainers: pass.trainers.clone(),
                issued_at: pass.issued_at,
            });
            for e in &guard.entries {
                events.push(Event::AttendanceAppended {
                    pass_id: pass.id,
                    entry_id: e.id,
                    date: e.date,
                    reservation_id: e.reservation_id,
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
