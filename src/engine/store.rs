use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

/// A violated store-level uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintViolation {
    /// Active bookings on the slot already equal its capacity.
    SlotFull { slot_id: Ulid },
    /// The (participant, service) pair already has an active booking.
    HolderTaken { participant_id: Ulid, service_id: Ulid },
}

/// All rows of one study plus the indexes the constraints are evaluated on.
///
/// `active_by_slot` and `active_by_holder` only ever contain BOOKED rows:
/// they are the partial unique indexes on `(slot_id)` (bounded by capacity)
/// and `(participant_id, service_id)`.
#[derive(Debug, Default)]
pub struct Tables {
    pub services: HashMap<Ulid, Service>,
    pub participants: HashMap<Ulid, Participant>,
    pub slots: HashMap<Ulid, Slot>,
    pub bookings: HashMap<Ulid, Booking>,
    active_by_slot: HashMap<Ulid, Vec<Ulid>>,
    active_by_holder: HashMap<(Ulid, Ulid), Ulid>,
    slots_by_service: HashMap<Ulid, Vec<Ulid>>,
    bookings_by_participant: HashMap<Ulid, Vec<Ulid>>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Index reads ──────────────────────────────────────────

    pub fn active_count(&self, slot_id: &Ulid) -> u32 {
        self.active_by_slot
            .get(slot_id)
            .map_or(0, |ids| ids.len() as u32)
    }

    pub fn active_holders(&self, slot_id: &Ulid) -> &[Ulid] {
        self.active_by_slot
            .get(slot_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn active_booking_for(&self, participant_id: Ulid, service_id: Ulid) -> Option<Ulid> {
        self.active_by_holder
            .get(&(participant_id, service_id))
            .copied()
    }

    pub fn slot_ids_for_service(&self, service_id: &Ulid) -> &[Ulid] {
        self.slots_by_service
            .get(service_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn booking_ids_for_participant(&self, participant_id: &Ulid) -> &[Ulid] {
        self.bookings_by_participant
            .get(participant_id)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    // ── Constraints ──────────────────────────────────────────

    /// Evaluate both partial unique constraints for placing `booking_id` on `slot`
    /// as `(participant_id, service_id)`. Slot capacity is checked first.
    pub fn check_claim(
        &self,
        slot: &Slot,
        participant_id: Ulid,
        service_id: Ulid,
        booking_id: Ulid,
    ) -> Result<(), ConstraintViolation> {
        let others_on_slot = self
            .active_holders(&slot.id)
            .iter()
            .filter(|id| **id != booking_id)
            .count() as u32;
        if others_on_slot >= slot.capacity {
            return Err(ConstraintViolation::SlotFull { slot_id: slot.id });
        }
        match self.active_booking_for(participant_id, service_id) {
            Some(existing) if existing != booking_id => Err(ConstraintViolation::HolderTaken {
                participant_id,
                service_id,
            }),
            _ => Ok(()),
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event. Validation happened before the event was
    /// written, so this never fails; replay uses the same path.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ServiceCreated {
                id,
                name,
                modality,
                visit_phase,
            } => {
                self.services.insert(
                    *id,
                    Service {
                        id: *id,
                        name: name.clone(),
                        modality: *modality,
                        visit_phase: *visit_phase,
                        active: true,
                    },
                );
            }
            Event::ServiceActiveSet { id, active } => {
                if let Some(service) = self.services.get_mut(id) {
                    service.active = *active;
                }
            }
            Event::ParticipantRegistered { id, email } => {
                self.participants.insert(
                    *id,
                    Participant {
                        id: *id,
                        email: email.clone(),
                    },
                );
            }
            Event::SlotCreated {
                id,
                service_id,
                span,
                capacity,
            } => {
                self.slots.insert(
                    *id,
                    Slot {
                        id: *id,
                        service_id: *service_id,
                        span: *span,
                        capacity: *capacity,
                    },
                );
                self.slots_by_service.entry(*service_id).or_default().push(*id);
            }
            Event::SlotDeleted { id } => {
                if let Some(slot) = self.slots.remove(id)
                    && let Some(ids) = self.slots_by_service.get_mut(&slot.service_id)
                {
                    ids.retain(|s| s != id);
                }
                self.active_by_slot.remove(id);
            }
            Event::BookingCreated {
                id,
                participant_id,
                service_id,
                slot_id,
                at,
            } => {
                self.bookings.insert(
                    *id,
                    Booking {
                        id: *id,
                        participant_id: *participant_id,
                        service_id: *service_id,
                        slot_id: *slot_id,
                        status: BookingStatus::Booked,
                        created_at: *at,
                        cancelled_at: None,
                        reminder_sent_at: None,
                    },
                );
                self.active_by_slot.entry(*slot_id).or_default().push(*id);
                self.active_by_holder
                    .insert((*participant_id, *service_id), *id);
                self.bookings_by_participant
                    .entry(*participant_id)
                    .or_default()
                    .push(*id);
            }
            Event::BookingCancelled { id, at } => {
                let Some(booking) = self.bookings.get_mut(id) else {
                    return;
                };
                booking.status = BookingStatus::Cancelled;
                booking.cancelled_at = Some(*at);
                let (slot_id, holder) = (booking.slot_id, (booking.participant_id, booking.service_id));
                self.release_slot(&slot_id, id);
                if self.active_by_holder.get(&holder) == Some(id) {
                    self.active_by_holder.remove(&holder);
                }
            }
            Event::BookingRescheduled { id, from_slot, to_slot } => {
                let Some(booking) = self.bookings.get_mut(id) else {
                    return;
                };
                booking.slot_id = *to_slot;
                booking.reminder_sent_at = None;
                self.release_slot(from_slot, id);
                self.active_by_slot.entry(*to_slot).or_default().push(*id);
            }
            Event::ReminderMarked { id, slot_id, at } => {
                if let Some(booking) = self.bookings.get_mut(id)
                    && booking.slot_id == *slot_id
                {
                    booking.reminder_sent_at = Some(*at);
                }
            }
        }
    }

    fn release_slot(&mut self, slot_id: &Ulid, booking_id: &Ulid) {
        if let Some(ids) = self.active_by_slot.get_mut(slot_id) {
            ids.retain(|b| b != booking_id);
            if ids.is_empty() {
                self.active_by_slot.remove(slot_id);
            }
        }
    }
}
