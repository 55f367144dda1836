use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Capacity exhausted, or the slot is past, deleted, retired or belongs to another service.
    SlotNotAvailable(Ulid),
    DuplicateActiveBookingForService {
        participant_id: Ulid,
        service_id: Ulid,
    },
    BookingNotActive(Ulid),
    SlotHasActiveBooking(Ulid),
    SameSlot(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Expected, caller-actionable outcomes. These are not system failures.
    pub fn is_user_outcome(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotNotAvailable(_) => "slot_not_available",
            EngineError::DuplicateActiveBookingForService { .. } => "duplicate_active_booking",
            EngineError::BookingNotActive(_) => "booking_not_active",
            EngineError::SlotHasActiveBooking(_) => "slot_has_active_booking",
            EngineError::SameSlot(_) => "same_slot",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotNotAvailable(id) => {
                write!(f, "slot {id} is not available; refresh availability and retry")
            }
            EngineError::DuplicateActiveBookingForService {
                participant_id,
                service_id,
            } => write!(
                f,
                "participant {participant_id} already holds an active booking for service {service_id}"
            ),
            EngineError::BookingNotActive(id) => write!(f, "booking {id} is not active"),
            EngineError::SlotHasActiveBooking(id) => {
                write!(f, "cannot delete slot {id}: it has an active booking")
            }
            EngineError::SameSlot(id) => write!(f, "booking already holds slot {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
