use ulid::Ulid;

use crate::model::*;

use super::store::Tables;

// ── Availability ─────────────────────────────────────────────────

/// Slots of `service_id` that start after `now` and still have capacity,
/// earliest first, ties broken by slot id. A retired or unknown service has
/// no availability.
pub fn available_slots(tables: &Tables, service_id: &Ulid, now: Ms) -> Vec<AvailableSlot> {
    if !tables.services.get(service_id).is_some_and(|s| s.active) {
        return Vec::new();
    }

    let mut free: Vec<AvailableSlot> = tables
        .slot_ids_for_service(service_id)
        .iter()
        .filter_map(|id| tables.slots.get(id))
        .filter(|slot| slot.span.start > now)
        .filter_map(|slot| {
            let taken = tables.active_count(&slot.id);
            (taken < slot.capacity).then(|| AvailableSlot {
                slot_id: slot.id,
                service_id: slot.service_id,
                start: slot.span.start,
                end: slot.span.end,
                remaining: slot.capacity - taken,
            })
        })
        .collect();

    free.sort_by(|a, b| a.start.cmp(&b.start).then(a.slot_id.cmp(&b.slot_id)));
    free
}
