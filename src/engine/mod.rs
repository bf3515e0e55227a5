mod admin;
mod attendance;
mod capacity;
mod error;
mod ledger;
mod lifecycle;
mod overlap;
mod queries;
#[cfg(test)]
mod tests;

pub use capacity::admits;
pub use error::EngineError;
pub use ledger::CreditReceipt;
pub use lifecycle::AttendanceOutcome;
pub use overlap::count_overlapping;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::{LOCK_WAIT_MS, MAX_LOCK_ATTEMPTS};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedSpaceState = Arc<RwLock<SpaceState>>;
pub type SharedPassState = Arc<RwLock<PassState>>;

/// Source of "now" for admission checks and attendance timestamps.
pub type Clock = Arc<dyn Fn() -> Ms + Send + Sync>;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub fn system_clock() -> Clock {
    Arc::new(now_ms)
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// fsync once, then acknowledge every caller in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        // Compaction must observe every append queued ahead of it.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so partially buffered bytes
    // don't leak into the next batch (callers are told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Event application ────────────────────────────────────

/// Apply a space-scoped event. Caller holds the space's write lock.
fn apply_to_space(ss: &mut SpaceState, event: &Event, reservation_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::SpaceUpdated { name, capacity, .. } => {
            ss.name = name.clone();
            ss.capacity = *capacity;
        }
        Event::ReservationCreated {
            id,
            space_id,
            client_id,
            span,
            pass_id,
            created_at,
        } => {
            ss.insert_reservation(Reservation {
                id: *id,
                client_id: client_id.clone(),
                space_id: *space_id,
                span: *span,
                status: ReservationStatus::Confirmed,
                attendance_registered: false,
                pass_id: *pass_id,
                created_at: *created_at,
            });
            reservation_index.insert(*id, *space_id);
        }
        Event::ReservationMoved { id, span, .. } => {
            if let Some(mut r) = ss.remove_reservation(*id) {
                r.span = *span;
                ss.insert_reservation(r);
            }
        }
        Event::AttendanceRegistered { id, .. } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.attendance_registered = true;
            }
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = ss.reservation_mut(id) {
                r.status = ReservationStatus::Cancelled;
            }
        }
        _ => {}
    }
}

/// Apply a pass-scoped event. Caller holds the pass's write lock.
fn apply_to_pass(ps: &mut PassState, event: &Event, entry_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::PaymentStatusChanged { payment_status, .. } => {
            ps.pass.payment_status = *payment_status;
        }
        Event::AttendanceRegistered {
            id,
            credit: Some(credit),
            ..
        } => {
            ledger::apply_consume(
                ps,
                AttendanceEntry {
                    id: credit.entry_id,
                    pass_id: credit.pass_id,
                    date: credit.date,
                    reservation_id: Some(*id),
                },
            );
            entry_index.insert(credit.entry_id, credit.pass_id);
        }
        Event::AttendanceAppended {
            pass_id,
            entry_id,
            date,
            reservation_id,
        } => {
            ledger::apply_consume(
                ps,
                AttendanceEntry {
                    id: *entry_id,
                    pass_id: *pass_id,
                    date: *date,
                    reservation_id: *reservation_id,
                },
            );
            entry_index.insert(*entry_id, *pass_id);
        }
        Event::AttendanceEdited { entry_id, date, .. } => {
            ledger::apply_edit(ps, *entry_id, *date);
        }
        Event::AttendanceRemoved { entry_id, .. } => {
            ledger::apply_restore(ps, *entry_id);
            entry_index.remove(entry_id);
        }
        _ => {}
    }
}

fn event_space_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::SpaceUpdated { id, .. } => Some(*id),
        Event::ReservationCreated { space_id, .. }
        | Event::ReservationMoved { space_id, .. }
        | Event::AttendanceRegistered { space_id, .. }
        | Event::ReservationCancelled { space_id, .. } => Some(*space_id),
        _ => None,
    }
}

fn event_pass_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PaymentStatusChanged { id, .. } => Some(*id),
        Event::AttendanceRegistered { credit, .. } => credit.as_ref().map(|c| c.pass_id),
        Event::AttendanceAppended { pass_id, .. }
        | Event::AttendanceEdited { pass_id, .. }
        | Event::AttendanceRemoved { pass_id, .. } => Some(*pass_id),
        _ => None,
    }
}

fn pass_from_issued(event: &Event) -> Option<SessionPass> {
    let Event::PassIssued {
        id,
        client_id,
        kind,
        total_sessions,
        session_duration_minutes,
        payment_status,
        trainers,
        issued_at,
    } = event
    else {
        return None;
    };
    Some(SessionPass {
        id: *id,
        client_id: client_id.clone(),
        kind: *kind,
        total_sessions: *total_sessions,
        remaining_sessions: *total_sessions,
        session_duration_minutes: *session_duration_minutes,
        payment_status: *payment_status,
        trainers: trainers.clone(),
        last_attendance_time: None,
        issued_at: *issued_at,
    })
}

/// Wait for a write lock, giving up after `MAX_LOCK_ATTEMPTS` timed-out waits.
async fn acquire_write<T>(lock: Arc<RwLock<T>>) -> Result<OwnedRwLockWriteGuard<T>, EngineError> {
    for attempt in 1..=MAX_LOCK_ATTEMPTS {
        let wait = tokio::time::timeout(
            Duration::from_millis(LOCK_WAIT_MS),
            lock.clone().write_owned(),
        );
        match wait.await {
            Ok(guard) => return Ok(guard),
            Err(_) => {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                tracing::debug!(attempt, "write lock wait timed out");
            }
        }
    }
    Err(EngineError::ConcurrentConflict)
}

/// The Record Store and the booking engine on top of it, for one tenant.
///
/// Each space (with its reservations) and each pass (with its attendance log)
/// sits behind its own lock; holding that write lock across the check and the
/// WAL commit makes check-then-write atomic. When both are needed the space
/// lock is taken first.
pub struct Engine {
    pub(super) spaces: DashMap<Ulid, SharedSpaceState>,
    pub(super) passes: DashMap<Ulid, SharedPassState>,
    /// Reverse lookup: reservation id → space id
    pub(super) reservation_to_space: DashMap<Ulid, Ulid>,
    /// Reverse lookup: attendance entry id → pass id
    pub(super) entry_to_pass: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared; compaction holds it exclusively so the
    /// snapshot it writes cannot miss a concurrent append.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    clock: Clock,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_clock(wal_path, notify, system_clock())
    }

    pub fn with_clock(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Clock) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_to_space = DashMap::new();
        let entry_to_pass = DashMap::new();
        let mut spaces: HashMap<Ulid, SpaceState> = HashMap::new();
        let mut passes: HashMap<Ulid, PassState> = HashMap::new();

        for event in &events {
            match event {
                Event::SpaceCreated { id, name, capacity } => {
                    spaces.insert(*id, SpaceState::new(*id, name.clone(), *capacity));
                }
                Event::SpaceDeleted { id } => {
                    if let Some(ss) = spaces.remove(id) {
                        for r in &ss.reservations {
                            reservation_to_space.remove(&r.id);
                        }
                    }
                }
                Event::PassIssued { id, .. } => {
                    if let Some(pass) = pass_from_issued(event) {
                        passes.insert(*id, PassState::new(pass));
                    }
                }
                Event::PassDeleted { id } => {
                    if let Some(ps) = passes.remove(id) {
                        for e in &ps.entries {
                            entry_to_pass.remove(&e.id);
                        }
                    }
                }
                other => {
                    if let Some(space_id) = event_space_id(other)
                        && let Some(ss) = spaces.get_mut(&space_id)
                    {
                        apply_to_space(ss, other, &reservation_to_space);
                    }
                    if let Some(pass_id) = event_pass_id(other)
                        && let Some(ps) = passes.get_mut(&pass_id)
                    {
                        apply_to_pass(ps, other, &entry_to_pass);
                    }
                }
            }
        }

        tracing::debug!(
            events = events.len(),
            spaces = spaces.len(),
            passes = passes.len(),
            "replayed WAL {}",
            wal_path.display()
        );

        Ok(Self {
            spaces: spaces
                .into_iter()
                .map(|(id, ss)| (id, Arc::new(RwLock::new(ss))))
                .collect(),
            passes: passes
                .into_iter()
                .map(|(id, ps)| (id, Arc::new(RwLock::new(ps))))
                .collect(),
            reservation_to_space,
            entry_to_pass,
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            clock,
        })
    }

    pub fn now(&self) -> Ms {
        (self.clock)()
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_space(&self, id: &Ulid) -> Option<SharedSpaceState> {
        self.spaces.get(id).map(|e| e.value().clone())
    }

    pub fn get_pass(&self, id: &Ulid) -> Option<SharedPassState> {
        self.passes.get(id).map(|e| e.value().clone())
    }

    pub fn space_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_space.get(reservation_id).map(|e| *e.value())
    }

    pub fn pass_for_entry(&self, entry_id: &Ulid) -> Option<Ulid> {
        self.entry_to_pass.get(entry_id).map(|e| *e.value())
    }

    /// Change notifications for one space or pass.
    pub fn subscribe(&self, record_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(record_id)
    }

    /// Write-lock a space, failing if it is missing or was deleted while we waited.
    pub(super) async fn lock_space(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let ss = self.get_space(id).ok_or(EngineError::SpaceNotFound(*id))?;
        let guard = acquire_write(ss).await?;
        if !self.spaces.contains_key(id) {
            return Err(EngineError::SpaceNotFound(*id));
        }
        Ok(guard)
    }

    pub(super) async fn lock_pass(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PassState>, EngineError> {
        let ps = self.get_pass(id).ok_or(EngineError::PassNotFound(*id))?;
        let guard = acquire_write(ps).await?;
        if !self.passes.contains_key(id) {
            return Err(EngineError::PassNotFound(*id));
        }
        Ok(guard)
    }

    /// Lookup reservation → space, then write-lock that space.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<SpaceState>, EngineError> {
        let space_id = self
            .space_for_reservation(reservation_id)
            .ok_or(EngineError::ReservationNotFound(*reservation_id))?;
        let guard = self.lock_space(&space_id).await.map_err(|e| match e {
            EngineError::SpaceNotFound(_) => EngineError::ReservationNotFound(*reservation_id),
            other => other,
        })?;
        if guard.reservation(reservation_id).is_none() {
            return Err(EngineError::ReservationNotFound(*reservation_id));
        }
        Ok(guard)
    }

    /// WAL-append, apply to the space, notify.
    pub(super) async fn persist_space(
        &self,
        ss: &mut SpaceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.reservation_to_space);
        self.notify.send(ss.id, event);
        Ok(())
    }

    /// WAL-append, apply to the pass, notify.
    pub(super) async fn persist_pass(
        &self,
        ps: &mut PassState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_pass(ps, event, &self.entry_to_pass);
        self.notify.send(ps.pass.id, event);
        Ok(())
    }

    /// WAL-append one event that touches a space and (optionally) a pass.
    pub(super) async fn persist_space_and_pass(
        &self,
        ss: &mut SpaceState,
        ps: Option<&mut PassState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_space(ss, event, &self.reservation_to_space);
        self.notify.send(ss.id, event);
        if let Some(ps) = ps {
            apply_to_pass(ps, event, &self.entry_to_pass);
            self.notify.send(ps.pass.id, event);
        }
        Ok(())
    }
}
