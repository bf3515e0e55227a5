use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end.saturating_sub(self.start)
    }

    /// Strict half-open overlap: spans that only touch at an endpoint do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Spaces and reservations ─────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub client_id: String,
    pub space_id: Ulid,
    pub span: Span,
    pub status: ReservationStatus,
    pub attendance_registered: bool,
    pub pass_id: Option<Ulid>,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_confirmed(&self) -> bool {
        self.status == ReservationStatus::Confirmed
    }
}

/// Read-only snapshot of a space record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub id: Ulid,
    pub name: String,
    pub capacity: u32,
}

/// A space plus every reservation ever made on it (cancelled ones included).
/// Guarded by a single lock: that lock is the transaction scope for admission.
#[derive(Debug, Clone)]
pub struct SpaceState {
    pub id: Ulid,
    pub name: String,
    /// Max concurrent confirmed reservations.
    pub capacity: u32,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl SpaceState {
    pub fn new(id: Ulid, name: String, capacity: u32) -> Self {
        Self {
            id,
            name,
            capacity,
            reservations: Vec::new(),
        }
    }

    pub fn info(&self) -> Space {
        Space {
            id: self.id,
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn reservation_mut(&mut self, id: &Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == *id)
    }

    /// Reservations (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn confirmed_count(&self) -> usize {
        self.reservations.iter().filter(|r| r.is_confirmed()).count()
    }
}

// ── Session passes ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            _ => None,
        }
    }
}

/// Rental passes count hours of space use; session bundles count coached sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassKind {
    SpaceRental,
    SessionBundle,
}

impl PassKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PassKind::SpaceRental => "space_rental",
            PassKind::SessionBundle => "session_bundle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "space_rental" | "rental" => Some(PassKind::SpaceRental),
            "session_bundle" | "sessions" => Some(PassKind::SessionBundle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPass {
    pub id: Ulid,
    pub client_id: String,
    pub kind: PassKind,
    pub total_sessions: u32,
    pub remaining_sessions: u32,
    pub session_duration_minutes: u32,
    pub payment_status: PaymentStatus,
    pub trainers: Vec<String>,
    pub last_attendance_time: Option<Ms>,
    pub issued_at: Ms,
}

/// Fields supplied when issuing a pass. Remaining credit starts at `total_sessions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPass {
    pub client_id: String,
    pub kind: PassKind,
    pub total_sessions: u32,
    pub session_duration_minutes: u32,
    pub payment_status: PaymentStatus,
    pub trainers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub id: Ulid,
    pub pass_id: Ulid,
    pub date: Ms,
    /// Reservation whose attendance produced this entry, if any.
    pub reservation_id: Option<Ulid>,
}

/// A pass and its attendance log, guarded by one lock.
#[derive(Debug, Clone)]
pub struct PassState {
    pub pass: SessionPass,
    /// Sorted by `date`.
    pub entries: Vec<AttendanceEntry>,
}

impl PassState {
    pub fn new(pass: SessionPass) -> Self {
        Self {
            pass,
            entries: Vec::new(),
        }
    }

    pub fn insert_entry(&mut self, entry: AttendanceEntry) {
        let pos = self.entries.partition_point(|e| e.date <= entry.date);
        self.entries.insert(pos, entry);
    }

    pub fn remove_entry(&mut self, id: Ulid) -> Option<AttendanceEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    pub fn entry(&self, id: &Ulid) -> Option<&AttendanceEntry> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub fn latest_entry_date(&self) -> Option<Ms> {
        self.entries.last().map(|e| e.date)
    }
}

/// One unit of pass credit consumed by an attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUse {
    pub pass_id: Ulid,
    pub entry_id: Ulid,
    pub date: Ms,
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// A mutation that touches a reservation and a pass (attendance with credit)
/// is a single event, so it commits or fails as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SpaceCreated {
        id: Ulid,
        name: String,
        capacity: u32,
    },
    SpaceUpdated {
        id: Ulid,
        name: String,
        capacity: u32,
    },
    SpaceDeleted {
        id: Ulid,
    },
    PassIssued {
        id: Ulid,
        client_id: String,
        kind: PassKind,
        total_sessions: u32,
        session_duration_minutes: u32,
        payment_status: PaymentStatus,
        trainers: Vec<String>,
        issued_at: Ms,
    },
    PaymentStatusChanged {
        id: Ulid,
        payment_status: PaymentStatus,
    },
    PassDeleted {
        id: Ulid,
    },
    ReservationCreated {
        id: Ulid,
        space_id: Ulid,
        client_id: String,
        span: Span,
        pass_id: Option<Ulid>,
        created_at: Ms,
    },
    ReservationMoved {
        id: Ulid,
        space_id: Ulid,
        span: Span,
    },
    AttendanceRegistered {
        id: Ulid,
        space_id: Ulid,
        credit: Option<CreditUse>,
    },
    ReservationCancelled {
        id: Ulid,
        space_id: Ulid,
    },
    AttendanceAppended {
        pass_id: Ulid,
        entry_id: Ulid,
        date: Ms,
        reservation_id: Option<Ulid>,
    },
    AttendanceEdited {
        pass_id: Ulid,
        entry_id: Ulid,
        date: Ms,
    },
    AttendanceRemoved {
        pass_id: Ulid,
        entry_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Capacity picture of a space for one candidate interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub space_id: Ulid,
    pub capacity: u32,
    pub overlapping: usize,
    pub admits: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttendanceOrder {
    #[default]
    Oldest,
    Newest,
}
