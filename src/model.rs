use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Wall clock in `Ms`. Only the outer layers call this; the ledger takes `now` as an argument.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Every slot is exactly one hour long.
pub const SLOT_DURATION_MS: Ms = 3_600_000;

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

    /// A slot-length span starting at `start`.
    pub fn slot_at(start: Ms) -> Self {
        Self::new(start, start + SLOT_DURATION_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// True when the span starts in `(now, now + window]`.
    pub fn starts_within(&self, now: Ms, window: Ms) -> bool {
        self.start > now && self.start <= now + window
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Modality {
    Ultrasound,
    Mri,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Ultrasound => "US",
            Modality::Mri => "MRI",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "US" | "ULTRASOUND" => Some(Modality::Ultrasound),
            "MRI" => Some(Modality::Mri),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VisitPhase {
    Baseline,
    Followup,
}

impl VisitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            VisitPhase::Baseline => "BASELINE",
            VisitPhase::Followup => "FOLLOWUP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BASELINE" => Some(VisitPhase::Baseline),
            "FOLLOWUP" => Some(VisitPhase::Followup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Booked,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Booked => "BOOKED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub modality: Modality,
    pub visit_phase: VisitPhase,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Ulid,
    pub service_id: Ulid,
    pub span: Span,
    /// Max concurrent active bookings (at least 1).
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub participant_id: Ulid,
    pub service_id: Ulid,
    pub slot_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub cancelled_at: Option<Ms>,
    /// `None` until a reminder went out for the current slot assignment.
    pub reminder_sent_at: Option<Ms>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Booked
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: Ulid,
    pub email: String,
}

/// Ledger events, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ServiceCreated {
        id: Ulid,
        name: String,
        modality: Modality,
        visit_phase: VisitPhase,
    },
    ServiceActiveSet {
        id: Ulid,
        active: bool,
    },
    ParticipantRegistered {
        id: Ulid,
        email: String,
    },
    SlotCreated {
        id: Ulid,
        service_id: Ulid,
        span: Span,
        capacity: u32,
    },
    SlotDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        participant_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        at: Ms,
    },
    BookingRescheduled {
        id: Ulid,
        from_slot: Ulid,
        to_slot: Ulid,
    },
    ReminderMarked {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableSlot {
    pub slot_id: Ulid,
    pub service_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// Capacity left at the time of the snapshot.
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: String,
    pub modality: Modality,
    pub visit_phase: VisitPhase,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantBooking {
    pub booking_id: Ulid,
    pub status: BookingStatus,
    pub service_id: Ulid,
    pub service_name: String,
    pub modality: Modality,
    pub visit_phase: VisitPhase,
    pub slot_id: Ulid,
    /// Slot times are gone once an admin deleted the slot of a cancelled booking.
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub reminder_sent_at: Option<Ms>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub booked: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOverviewRow {
    pub slot_id: Ulid,
    pub service_name: String,
    pub modality: Modality,
    pub visit_phase: VisitPhase,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    pub booked: u32,
    pub holder_emails: Vec<String>,
}
