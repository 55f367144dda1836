use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{eligible_slot, validate_email, validate_name, validate_timestamp, violation_to_error};
use super::{Engine, EngineError};

impl Engine {
    // ── Services ─────────────────────────────────────────────

    pub async fn create_service(
        &self,
        id: Ulid,
        name: String,
        modality: Modality,
        visit_phase: VisitPhase,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        let mut tables = self.tables.write().await;
        if tables.services.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if tables.services.len() >= MAX_SERVICES_PER_STUDY {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let event = Event::ServiceCreated { id, name, modality, visit_phase };
        self.commit(&mut tables, event).await
    }

    /// Soft retirement. The active flag is the only mutable service field.
    pub async fn set_service_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        let service = tables.services.get(&id).ok_or(EngineError::NotFound(id))?;
        if service.active == active {
            return Ok(());
        }
        self.commit(&mut tables, Event::ServiceActiveSet { id, active }).await
    }

    // ── Participants ─────────────────────────────────────────

    /// Record identity and contact address as supplied by the identity provider.
    pub async fn register_participant(&self, id: Ulid, email: String) -> Result<(), EngineError> {
        validate_email(&email)?;
        let mut tables = self.tables.write().await;
        match tables.participants.get(&id) {
            Some(p) if p.email == email => return Ok(()),
            Some(_) => {}
            None if tables.participants.len() >= MAX_PARTICIPANTS_PER_STUDY => {
                return Err(EngineError::LimitExceeded("too many participants"));
            }
            None => {}
        }
        self.commit(&mut tables, Event::ParticipantRegistered { id, email }).await
    }

    // ── Slot Store ───────────────────────────────────────────

    pub async fn create_slot(
        &self,
        id: Ulid,
        service_id: Ulid,
        starts_at: Ms,
        capacity: u32,
    ) -> Result<Slot, EngineError> {
        validate_timestamp(starts_at)?;
        if capacity == 0 {
            return Err(EngineError::InvalidInput("capacity must be at least 1"));
        }
        if capacity > MAX_SLOT_CAPACITY {
            return Err(EngineError::LimitExceeded("slot capacity too large"));
        }
        let mut tables = self.tables.write().await;
        if !tables.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        if tables.slots.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if tables.slots.len() >= MAX_SLOTS_PER_STUDY {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        let span = Span::slot_at(starts_at);
        self.commit(&mut tables, Event::SlotCreated { id, service_id, span, capacity })
            .await?;
        Ok(Slot { id, service_id, span, capacity })
    }

    /// Delete a slot that holds no active booking. The check and the delete
    /// run under one write guard, so a booking cannot slip in between.
    pub async fn delete_slot(&self, id: Ulid) -> Result<(), EngineError> {
        let mut tables = self.tables.write().await;
        if !tables.slots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if tables.active_count(&id) > 0 {
            return Err(EngineError::SlotHasActiveBooking(id));
        }
        self.commit(&mut tables, Event::SlotDeleted { id }).await
    }

    // ── Booking Ledger ───────────────────────────────────────

    /// Book `slot_id` for `participant_id`. Eligibility, capacity and the
    /// one-active-booking-per-service rule are evaluated in that order,
    /// atomically with the insert.
    pub async fn create_booking(
        &self,
        id: Ulid,
        participant_id: Ulid,
        service_id: Ulid,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let mut tables = self.tables.write().await;
        if tables.bookings.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if tables.bookings.len() >= MAX_BOOKINGS_PER_STUDY {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let slot = eligible_slot(&tables, slot_id, service_id, now)?;
        tables
            .check_claim(slot, participant_id, service_id, id)
            .map_err(violation_to_error)?;

        let event = Event::BookingCreated {
            id,
            participant_id,
            service_id,
            slot_id,
            at: now,
        };
        self.commit(&mut tables, event).await?;
        Ok(tables.bookings[&id].clone())
    }

    /// BOOKED → CANCELLED. Cancelling twice is an error, not a no-op.
    pub async fn cancel_booking(&self, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        let mut tables = self.tables.write().await;
        let booking = tables.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() {
            return Err(EngineError::BookingNotActive(id));
        }
        self.commit(&mut tables, Event::BookingCancelled { id, at: now })
            .await?;
        Ok(tables.bookings[&id].clone())
    }

    /// Move an active booking to `new_slot_id` in one step: the new slot is
    /// validated and claimed, the old one released and the reminder marker
    /// cleared together. On any failure the booking is left untouched.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        new_slot_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let mut tables = self.tables.write().await;
        let booking = tables.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() {
            return Err(EngineError::BookingNotActive(id));
        }
        if booking.slot_id == new_slot_id {
            return Err(EngineError::SameSlot(new_slot_id));
        }
        let (from_slot, participant_id, service_id) =
            (booking.slot_id, booking.participant_id, booking.service_id);

        let slot = eligible_slot(&tables, new_slot_id, service_id, now)?;
        tables
            .check_claim(slot, participant_id, service_id, id)
            .map_err(violation_to_error)?;

        let event = Event::BookingRescheduled {
            id,
            from_slot,
            to_slot: new_slot_id,
        };
        self.commit(&mut tables, event).await?;
        Ok(tables.bookings[&id].clone())
    }

    /// Record that a reminder went out for `id` while it held `slot_id`.
    ///
    /// Returns `Ok(false)` without writing when the booking was cancelled,
    /// moved to another slot, or already marked since the reminder was
    /// computed.
    pub async fn mark_reminder_sent(
        &self,
        id: Ulid,
        slot_id: Ulid,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let mut tables = self.tables.write().await;
        let booking = tables.bookings.get(&id).ok_or(EngineError::NotFound(id))?;
        if !booking.is_active() || booking.slot_id != slot_id || booking.reminder_sent_at.is_some() {
            return Ok(false);
        }
        self.commit(&mut tables, Event::ReminderMarked { id, slot_id, at: now })
            .await?;
        Ok(true)
    }
}
