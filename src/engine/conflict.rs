use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::{ConstraintViolation, Tables};
use super::EngineError;

pub(crate) fn validate_timestamp(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("service name is empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("service name too long"));
    }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
        _ => Err(EngineError::InvalidInput("email must look like local@domain")),
    }
}

/// Translate a store constraint violation into the caller-facing outcome.
pub(crate) fn violation_to_error(v: ConstraintViolation) -> EngineError {
    match v {
        ConstraintViolation::SlotFull { slot_id } => EngineError::SlotNotAvailable(slot_id),
        ConstraintViolation::HolderTaken {
            participant_id,
            service_id,
        } => EngineError::DuplicateActiveBookingForService {
            participant_id,
            service_id,
        },
    }
}

/// Resolve a slot a booking may be placed on: it exists, belongs to
/// `service_id`, the service is active, and it starts after `now`.
/// Every failure is `SlotNotAvailable`.
pub(crate) fn eligible_slot(
    tables: &Tables,
    slot_id: Ulid,
    service_id: Ulid,
    now: Ms,
) -> Result<&Slot, EngineError> {
    let slot = tables
        .slots
        .get(&slot_id)
        .ok_or(EngineError::SlotNotAvailable(slot_id))?;
    if slot.service_id != service_id || slot.span.start <= now {
        return Err(EngineError::SlotNotAvailable(slot_id));
    }
    match tables.services.get(&service_id) {
        Some(service) if service.active => Ok(slot),
        _ => Err(EngineError::SlotNotAvailable(slot_id)),
    }
}
