use std::cmp::Reverse;

use ulid::Ulid;

use crate::model::*;

use super::availability::available_slots;
use super::Engine;

/// A booking due for a reminder, resolved against the same snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderCandidate {
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub email: String,
    pub service_name: String,
    pub starts_at: Ms,
}

#[derive(Debug, Default)]
pub struct ReminderScan {
    pub candidates: Vec<ReminderCandidate>,
    /// Bookings skipped because a referenced row is missing.
    pub integrity_failures: usize,
}

impl Engine {
    /// Open slots for a service, read at one consistent point.
    pub async fn available_slots(&self, service_id: Ulid, now: Ms) -> Vec<AvailableSlot> {
        let tables = self.tables.read().await;
        available_slots(&tables, &service_id, now)
    }

    /// Baseline before follow-up, ultrasound before MRI, then name.
    pub async fn list_services(&self, include_inactive: bool) -> Vec<ServiceInfo> {
        let tables = self.tables.read().await;
        let mut services: Vec<ServiceInfo> = tables
            .services
            .values()
            .filter(|s| include_inactive || s.active)
            .map(|s| ServiceInfo {
                id: s.id,
                name: s.name.clone(),
                modality: s.modality,
                visit_phase: s.visit_phase,
                active: s.active,
            })
            .collect();
        services.sort_by(|a, b| {
            (a.visit_phase, a.modality, &a.name, a.id).cmp(&(b.visit_phase, b.modality, &b.name, b.id))
        });
        services
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        self.tables.read().await.bookings.get(&id).cloned()
    }

    pub async fn get_slot(&self, id: Ulid) -> Option<Slot> {
        self.tables.read().await.slots.get(&id).cloned()
    }

    /// Every booking of a participant, latest slot first.
    pub async fn participant_bookings(&self, participant_id: Ulid) -> Vec<ParticipantBooking> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ParticipantBooking> = tables
            .booking_ids_for_participant(&participant_id)
            .iter()
            .filter_map(|id| tables.bookings.get(id))
            .filter_map(|b| {
                let Some(service) = tables.services.get(&b.service_id) else {
                    tracing::error!("booking {} references missing service {}", b.id, b.service_id);
                    return None;
                };
                let slot = tables.slots.get(&b.slot_id);
                Some(ParticipantBooking {
                    booking_id: b.id,
                    status: b.status,
                    service_id: b.service_id,
                    service_name: service.name.clone(),
                    modality: service.modality,
                    visit_phase: service.visit_phase,
                    slot_id: b.slot_id,
                    start: slot.map(|s| s.span.start),
                    end: slot.map(|s| s.span.end),
                    reminder_sent_at: b.reminder_sent_at,
                })
            })
            .collect();
        rows.sort_by_key(|r| (Reverse(r.start), r.booking_id));
        rows
    }

    /// How many active services the participant currently holds a booking for.
    pub async fn participant_progress(&self, participant_id: Ulid) -> Progress {
        let tables = self.tables.read().await;
        let active: Vec<&Service> = tables.services.values().filter(|s| s.active).collect();
        let booked = active
            .iter()
            .filter(|s| tables.active_booking_for(participant_id, s.id).is_some())
            .count();
        Progress {
            booked,
            total: active.len(),
        }
    }

    /// Admin view of every slot with its current occupancy.
    pub async fn slot_overview(&self) -> Vec<SlotOverviewRow> {
        let tables = self.tables.read().await;
        let mut rows: Vec<SlotOverviewRow> = tables
            .slots
            .values()
            .filter_map(|slot| {
                let Some(service) = tables.services.get(&slot.service_id) else {
                    tracing::error!("slot {} references missing service {}", slot.id, slot.service_id);
                    return None;
                };
                let holders = tables.active_holders(&slot.id);
                let holder_emails = holders
                    .iter()
                    .filter_map(|id| tables.bookings.get(id))
                    .filter_map(|b| tables.participants.get(&b.participant_id))
                    .map(|p| p.email.clone())
                    .collect();
                Some(SlotOverviewRow {
                    slot_id: slot.id,
                    service_name: service.name.clone(),
                    modality: service.modality,
                    visit_phase: service.visit_phase,
                    start: slot.span.start,
                    end: slot.span.end,
                    capacity: slot.capacity,
                    booked: holders.len() as u32,
                    holder_emails,
                })
            })
            .collect();
        rows.sort_by_key(|r| (r.start, r.slot_id));
        rows
    }

    /// Active, not-yet-reminded bookings whose slot starts in `(now, now + window]`,
    /// with contact address and service name resolved. Missing cross-references
    /// are logged and counted, never retried here.
    pub async fn reminder_candidates(&self, now: Ms, window: Ms) -> ReminderScan {
        let tables = self.tables.read().await;
        let mut scan = ReminderScan::default();

        for booking in tables.bookings.values() {
            if !booking.is_active() || booking.reminder_sent_at.is_some() {
                continue;
            }
            let Some(slot) = tables.slots.get(&booking.slot_id) else {
                tracing::error!(
                    booking_id = %booking.id,
                    slot_id = %booking.slot_id,
                    "active booking references a missing slot"
                );
                scan.integrity_failures += 1;
                continue;
            };
            if !slot.span.starts_within(now, window) {
                continue;
            }
            let Some(participant) = tables.participants.get(&booking.participant_id) else {
                tracing::error!(
                    booking_id = %booking.id,
                    participant_id = %booking.participant_id,
                    "no contact address for participant"
                );
                scan.integrity_failures += 1;
                continue;
            };
            let Some(service) = tables.services.get(&booking.service_id) else {
                tracing::error!(
                    booking_id = %booking.id,
                    service_id = %booking.service_id,
                    "active booking references a missing service"
                );
                scan.integrity_failures += 1;
                continue;
            };
            scan.candidates.push(ReminderCandidate {
                booking_id: booking.id,
                slot_id: slot.id,
                email: participant.email.clone(),
                service_name: service.name.clone(),
                starts_at: slot.span.start,
            });
        }

        scan.candidates
            .sort_by_key(|c| (c.starts_at, c.booking_id));
        scan
    }
}
