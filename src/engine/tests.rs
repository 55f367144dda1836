use std::path::PathBuf;
use std::sync::Arc;

use ulid::Ulid;

use super::*;

const H: Ms = 3_600_000; // 1 hour in ms
const NOW: Ms = 1_800_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("studyslot_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Engine with one active service. Returns (engine, service_id).
async fn engine_with_service(name: &str) -> (Engine, Ulid) {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    let service_id = Ulid::new();
    engine
        .create_service(service_id, "Baseline US".into(), Modality::Ultrasound, VisitPhase::Baseline)
        .await
        .unwrap();
    (engine, service_id)
}

async fn slot(engine: &Engine, service_id: Ulid, start: Ms) -> Ulid {
    let id = Ulid::new();
    engine.create_slot(id, service_id, start, 1).await.unwrap();
    id
}

// ── Slot Store ───────────────────────────────────────────

#[tokio::test]
async fn create_slot_is_one_hour() {
    let (engine, service_id) = engine_with_service("slot_one_hour.wal").await;
    let id = Ulid::new();
    let s = engine.create_slot(id, service_id, NOW + H, 1).await.unwrap();
    assert_eq!(s.span, Span::new(NOW + H, NOW + 2 * H));
    assert_eq!(engine.get_slot(id).await, Some(s));
}

#[tokio::test]
async fn create_slot_validation() {
    let (engine, service_id) = engine_with_service("slot_validation.wal").await;
    assert!(matches!(
        engine.create_slot(Ulid::new(), service_id, NOW, 0).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_slot(Ulid::new(), Ulid::new(), NOW, 1).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.create_slot(Ulid::new(), service_id, 5, 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let id = slot(&engine, service_id, NOW + H).await;
    assert_eq!(
        engine.create_slot(id, service_id, NOW + 2 * H, 1).await,
        Err(EngineError::AlreadyExists(id))
    );
}

#[tokio::test]
async fn delete_slot_guarded_by_active_booking() {
    let (engine, service_id) = engine_with_service("delete_guard.wal").await;
    let s = slot(&engine, service_id, NOW + 2 * H).await;
    let b1 = Ulid::new();
    engine
        .create_booking(b1, Ulid::new(), service_id, s, NOW)
        .await
        .unwrap();

    assert_eq!(engine.delete_slot(s).await, Err(EngineError::SlotHasActiveBooking(s)));
    assert!(engine.get_slot(s).await.is_some());

    engine.cancel_booking(b1, NOW + 1).await.unwrap();
    engine.delete_slot(s).await.unwrap();
    assert!(engine.get_slot(s).await.is_none());
    assert_eq!(engine.delete_slot(s).await, Err(EngineError::NotFound(s)));
}

// ── Booking Ledger: create ───────────────────────────────

#[tokio::test]
async fn second_create_on_full_slot_then_cancel_frees_it() {
    let (engine, service_id) = engine_with_service("full_then_cancel.wal").await;
    let s = slot(&engine, service_id, NOW + 2 * H).await;
    let (p1, p2) = (Ulid::new(), Ulid::new());

    let b1 = engine
        .create_booking(Ulid::new(), p1, service_id, s, NOW)
        .await
        .unwrap();
    assert_eq!(b1.status, BookingStatus::Booked);
    assert_eq!(b1.created_at, NOW);
    assert_eq!(b1.reminder_sent_at, None);

    assert_eq!(
        engine.create_booking(Ulid::new(), p2, service_id, s, NOW).await,
        Err(EngineError::SlotNotAvailable(s))
    );

    engine.cancel_booking(b1.id, NOW).await.unwrap();
    let b2 = engine
        .create_booking(Ulid::new(), p2, service_id, s, NOW)
        .await
        .unwrap();
    assert_eq!(b2.participant_id, p2);
}

#[tokio::test]
async fn one_active_booking_per_participant_and_service() {
    let (engine, service_id) = engine_with_service("dup_holder.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let s2 = slot(&engine, service_id, NOW + 2 * H).await;
    let p = Ulid::new();

    engine.create_booking(Ulid::new(), p, service_id, s1, NOW).await.unwrap();
    assert_eq!(
        engine.create_booking(Ulid::new(), p, service_id, s2, NOW).await,
        Err(EngineError::DuplicateActiveBookingForService {
            participant_id: p,
            service_id
        })
    );

    // A different service is independent.
    let other = Ulid::new();
    engine
        .create_service(other, "Baseline MRI".into(), Modality::Mri, VisitPhase::Baseline)
        .await
        .unwrap();
    let s3 = slot(&engine, other, NOW + H).await;
    engine.create_booking(Ulid::new(), p, other, s3, NOW).await.unwrap();
}

#[tokio::test]
async fn create_rejects_ineligible_slots() {
    let (engine, service_id) = engine_with_service("ineligible.wal").await;
    let past = slot(&engine, service_id, NOW - H).await;
    let starting_now = slot(&engine, service_id, NOW).await;
    let p = Ulid::new();

    for s in [past, starting_now] {
        assert_eq!(
            engine.create_booking(Ulid::new(), p, service_id, s, NOW).await,
            Err(EngineError::SlotNotAvailable(s))
        );
    }

    let missing = Ulid::new();
    assert_eq!(
        engine.create_booking(Ulid::new(), p, service_id, missing, NOW).await,
        Err(EngineError::SlotNotAvailable(missing))
    );

    // Slot of another service
    let other = Ulid::new();
    engine
        .create_service(other, "Followup US".into(), Modality::Ultrasound, VisitPhase::Followup)
        .await
        .unwrap();
    let foreign = slot(&engine, other, NOW + H).await;
    assert_eq!(
        engine.create_booking(Ulid::new(), p, service_id, foreign, NOW).await,
        Err(EngineError::SlotNotAvailable(foreign))
    );
}

#[tokio::test]
async fn retired_service_blocks_new_bookings_but_not_cancel() {
    let (engine, service_id) = engine_with_service("retired.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let s2 = slot(&engine, service_id, NOW + 2 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s1, NOW)
        .await
        .unwrap();

    engine.set_service_active(service_id, false).await.unwrap();
    assert_eq!(
        engine.create_booking(Ulid::new(), Ulid::new(), service_id, s2, NOW).await,
        Err(EngineError::SlotNotAvailable(s2))
    );
    assert_eq!(
        engine.reschedule_booking(b.id, s2, NOW).await,
        Err(EngineError::SlotNotAvailable(s2))
    );
    assert!(engine.available_slots(service_id, NOW).await.is_empty());
    engine.cancel_booking(b.id, NOW).await.unwrap();

    engine.set_service_active(service_id, true).await.unwrap();
    assert_eq!(engine.available_slots(service_id, NOW).await.len(), 2);
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let (engine, service_id) = engine_with_service("dup_id.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let s2 = slot(&engine, service_id, NOW + 2 * H).await;
    let id = Ulid::new();
    engine.create_booking(id, Ulid::new(), service_id, s1, NOW).await.unwrap();
    assert_eq!(
        engine.create_booking(id, Ulid::new(), service_id, s2, NOW).await,
        Err(EngineError::AlreadyExists(id))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_on_one_slot_admit_exactly_one() {
    let (engine, service_id) = engine_with_service("race_slot.wal").await;
    let engine = Arc::new(engine);
    let s = slot(&engine, service_id, NOW + 2 * H).await;

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_booking(Ulid::new(), Ulid::new(), service_id, s, NOW)
                    .await
            })
        })
        .collect();

    let mut ok = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, EngineError::SlotNotAvailable(s)),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_by_one_participant_admit_exactly_one() {
    let (engine, service_id) = engine_with_service("race_holder.wal").await;
    let engine = Arc::new(engine);
    let mut slots = Vec::new();
    for i in 0..16 {
        slots.push(slot(&engine, service_id, NOW + (i + 1) * H).await);
    }
    let p = Ulid::new();

    let tasks: Vec<_> = slots
        .into_iter()
        .map(|s| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.create_booking(Ulid::new(), p, service_id, s, NOW).await
            })
        })
        .collect();

    let mut ok = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::DuplicateActiveBookingForService { .. })),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_three_admits_three_under_contention() {
    let (engine, service_id) = engine_with_service("race_capacity.wal").await;
    let engine = Arc::new(engine);
    let s = Ulid::new();
    engine.create_slot(s, service_id, NOW + H, 3).await.unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .create_booking(Ulid::new(), Ulid::new(), service_id, s, NOW)
                    .await
            })
        })
        .collect();
    let mut ok = 0;
    for t in tasks {
        if t.await.unwrap().is_ok() {
            ok += 1;
        }
    }
    assert_eq!(ok, 3);
    assert!(engine.available_slots(service_id, NOW).await.is_empty());
}

// ── Booking Ledger: cancel ───────────────────────────────

#[tokio::test]
async fn cancel_twice_is_an_error() {
    let (engine, service_id) = engine_with_service("cancel_twice.wal").await;
    let s = slot(&engine, service_id, NOW + H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s, NOW)
        .await
        .unwrap();

    let cancelled = engine.cancel_booking(b.id, NOW + 5).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.cancelled_at, Some(NOW + 5));

    assert_eq!(
        engine.cancel_booking(b.id, NOW + 6).await,
        Err(EngineError::BookingNotActive(b.id))
    );
    let missing = Ulid::new();
    assert_eq!(engine.cancel_booking(missing, NOW).await, Err(EngineError::NotFound(missing)));
}

// ── Booking Ledger: reschedule ───────────────────────────

#[tokio::test]
async fn reschedule_moves_claim_and_frees_old_slot() {
    let (engine, service_id) = engine_with_service("reschedule_ok.wal").await;
    let old = slot(&engine, service_id, NOW + H).await;
    let new = slot(&engine, service_id, NOW + 3 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, old, NOW)
        .await
        .unwrap();

    let moved = engine.reschedule_booking(b.id, new, NOW).await.unwrap();
    assert_eq!(moved.slot_id, new);
    assert_eq!(moved.reminder_sent_at, None);
    assert_eq!(moved.status, BookingStatus::Booked);

    let free: Vec<Ulid> = engine
        .available_slots(service_id, NOW)
        .await
        .iter()
        .map(|a| a.slot_id)
        .collect();
    assert_eq!(free, vec![old]);

    // Old slot is bookable by someone else, new one is not.
    engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, old, NOW)
        .await
        .unwrap();
    assert_eq!(
        engine.create_booking(Ulid::new(), Ulid::new(), service_id, new, NOW).await,
        Err(EngineError::SlotNotAvailable(new))
    );
}

#[tokio::test]
async fn failed_reschedule_leaves_booking_intact() {
    let (engine, service_id) = engine_with_service("reschedule_fail.wal").await;
    let held = slot(&engine, service_id, NOW + H).await;
    let taken = slot(&engine, service_id, NOW + 2 * H).await;
    let past = slot(&engine, service_id, NOW - H).await;

    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, held, NOW)
        .await
        .unwrap();
    engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, taken, NOW)
        .await
        .unwrap();
    engine.mark_reminder_sent(b.id, held, NOW).await.unwrap();

    for target in [taken, past, Ulid::new()] {
        assert_eq!(
            engine.reschedule_booking(b.id, target, NOW).await,
            Err(EngineError::SlotNotAvailable(target))
        );
        let after = engine.get_booking(b.id).await.unwrap();
        assert_eq!(after.slot_id, held);
        assert_eq!(after.reminder_sent_at, Some(NOW));
    }
    // Held slot is still claimed by b.
    assert_eq!(
        engine.create_booking(Ulid::new(), Ulid::new(), service_id, held, NOW).await,
        Err(EngineError::SlotNotAvailable(held))
    );
}

#[tokio::test]
async fn reschedule_rejects_same_slot_and_inactive_booking() {
    let (engine, service_id) = engine_with_service("reschedule_reject.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let s2 = slot(&engine, service_id, NOW + 2 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s1, NOW)
        .await
        .unwrap();

    assert_eq!(engine.reschedule_booking(b.id, s1, NOW).await, Err(EngineError::SameSlot(s1)));

    engine.cancel_booking(b.id, NOW).await.unwrap();
    assert_eq!(
        engine.reschedule_booking(b.id, s2, NOW).await,
        Err(EngineError::BookingNotActive(b.id))
    );
    let missing = Ulid::new();
    assert_eq!(
        engine.reschedule_booking(missing, s2, NOW).await,
        Err(EngineError::NotFound(missing))
    );
}

#[tokio::test]
async fn reschedule_into_other_service_slot_rejected() {
    let (engine, service_id) = engine_with_service("reschedule_foreign.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let other = Ulid::new();
    engine
        .create_service(other, "Followup MRI".into(), Modality::Mri, VisitPhase::Followup)
        .await
        .unwrap();
    let foreign = slot(&engine, other, NOW + 2 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s1, NOW)
        .await
        .unwrap();
    assert_eq!(
        engine.reschedule_booking(b.id, foreign, NOW).await,
        Err(EngineError::SlotNotAvailable(foreign))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reschedule_racing_create_for_same_target() {
    let (engine, service_id) = engine_with_service("reschedule_race.wal").await;
    let engine = Arc::new(engine);
    let held = slot(&engine, service_id, NOW + H).await;
    let target = slot(&engine, service_id, NOW + 2 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, held, NOW)
        .await
        .unwrap();

    let e1 = engine.clone();
    let mover = tokio::spawn(async move { e1.reschedule_booking(b.id, target, NOW).await });
    let e2 = engine.clone();
    let booker = tokio::spawn(async move {
        e2.create_booking(Ulid::new(), Ulid::new(), service_id, target, NOW).await
    });
    let (moved, booked) = (mover.await.unwrap(), booker.await.unwrap());

    // Exactly one of them owns the target; the mover is never left without a slot.
    assert!(moved.is_ok() ^ booked.is_ok());
    let after = engine.get_booking(b.id).await.unwrap();
    if moved.is_ok() {
        assert_eq!(after.slot_id, target);
    } else {
        assert_eq!(after.slot_id, held);
    }
}

// ── Reminder marker ──────────────────────────────────────

#[tokio::test]
async fn reminder_mark_is_conditional_on_slot() {
    let (engine, service_id) = engine_with_service("mark_conditional.wal").await;
    let s1 = slot(&engine, service_id, NOW + H).await;
    let s2 = slot(&engine, service_id, NOW + 2 * H).await;
    let b = engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s1, NOW)
        .await
        .unwrap();

    // Computed for s1, but the booking moved before the mark.
    engine.reschedule_booking(b.id, s2, NOW).await.unwrap();
    assert!(!engine.mark_reminder_sent(b.id, s1, NOW).await.unwrap());
    assert_eq!(engine.get_booking(b.id).await.unwrap().reminder_sent_at, None);

    assert!(engine.mark_reminder_sent(b.id, s2, NOW).await.unwrap());
    assert!(!engine.mark_reminder_sent(b.id, s2, NOW + 1).await.unwrap());
    assert_eq!(engine.get_booking(b.id).await.unwrap().reminder_sent_at, Some(NOW));
}

#[tokio::test]
async fn reminder_candidates_window_and_marker() {
    let (engine, service_id) = engine_with_service("candidates.wal").await;
    let soon = slot(&engine, service_id, NOW + 10 * H).await;
    let edge = slot(&engine, service_id, NOW + 24 * H).await;
    let later = slot(&engine, service_id, NOW + 24 * H + 1).await;

    let mut ids = Vec::new();
    for s in [soon, edge, later] {
        let p = Ulid::new();
        engine.register_participant(p, format!("{p}@example.org")).await.unwrap();
        let b = engine.create_booking(Ulid::new(), p, service_id, s, NOW).await.unwrap();
        ids.push(b.id);
    }

    let scan = engine.reminder_candidates(NOW, 24 * H).await;
    let got: Vec<Ulid> = scan.candidates.iter().map(|c| c.booking_id).collect();
    assert_eq!(got, vec![ids[0], ids[1]]);
    assert_eq!(scan.integrity_failures, 0);
    assert_eq!(scan.candidates[0].service_name, "Baseline US");
    assert_eq!(scan.candidates[0].starts_at, NOW + 10 * H);

    engine.mark_reminder_sent(ids[0], soon, NOW).await.unwrap();
    let scan = engine.reminder_candidates(NOW, 24 * H).await;
    assert_eq!(scan.candidates.len(), 1);
    assert_eq!(scan.candidates[0].booking_id, ids[1]);
}

#[tokio::test]
async fn reminder_candidates_count_missing_contact() {
    let (engine, service_id) = engine_with_service("candidates_missing.wal").await;
    let s = slot(&engine, service_id, NOW + H).await;
    engine
        .create_booking(Ulid::new(), Ulid::new(), service_id, s, NOW)
        .await
        .unwrap();
    let scan = engine.reminder_candidates(NOW, 24 * H).await;
    assert!(scan.candidates.is_empty());
    assert_eq!(scan.integrity_failures, 1);
}

// ── Read models ──────────────────────────────────────────

#[tokio::test]
async fn services_listed_baseline_first_then_us() {
    let engine = Engine::new(test_wal_path("list_services.wal")).unwrap();
    let specs = [
        ("Followup MRI", Modality::Mri, VisitPhase::Followup),
        ("Baseline MRI", Modality::Mri, VisitPhase::Baseline),
        ("Followup US", Modality::Ultrasound, VisitPhase::Followup),
        ("Baseline US", Modality::Ultrasound, VisitPhase::Baseline),
    ];
    let mut retired = None;
    for (name, m, v) in specs {
        let id = Ulid::new();
        engine.create_service(id, name.into(), m, v).await.unwrap();
        if name == "Followup US" {
            retired = Some(id);
        }
    }
    engine.set_service_active(retired.unwrap(), false).await.unwrap();

    let names: Vec<String> = engine.list_services(true).await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Baseline US", "Baseline MRI", "Followup US", "Followup MRI"]);
    let active: Vec<String> = engine.list_services(false).await.into_iter().map(|s| s.name).collect();
    assert_eq!(active, vec!["Baseline US", "Baseline MRI", "Followup MRI"]);
}

#[tokio::test]
async fn service_validation() {
    let engine = Engine::new(test_wal_path("service_validation.wal")).unwrap();
    assert!(matches!(
        engine
            .create_service(Ulid::new(), "  ".into(), Modality::Mri, VisitPhase::Baseline)
            .await,
        Err(EngineError::InvalidInput(_))
    ));
    let missing = Ulid::new();
    assert_eq!(
        engine.set_service_active(missing, false).await,
        Err(EngineError::NotFound(missing))
    );
}

#[tokio::test]
async fn participant_bookings_and_progress() {
    let (engine, us) = engine_with_service("participant_view.wal").await;
    let mri = Ulid::new();
    engine
        .create_service(mri, "Baseline MRI".into(), Modality::Mri, VisitPhase::Baseline)
        .await
        .unwrap();
    let p = Ulid::new();
    let s_us = slot(&engine, us, NOW + H).await;
    let s_us2 = slot(&engine, us, NOW + 5 * H).await;
    let s_mri = slot(&engine, mri, NOW + 3 * H).await;

    let first = engine.create_booking(Ulid::new(), p, us, s_us, NOW).await.unwrap();
    engine.cancel_booking(first.id, NOW).await.unwrap();
    engine.create_booking(Ulid::new(), p, us, s_us2, NOW).await.unwrap();
    assert_eq!(engine.participant_progress(p).await, Progress { booked: 1, total: 2 });
    engine.create_booking(Ulid::new(), p, mri, s_mri, NOW).await.unwrap();
    assert_eq!(engine.participant_progress(p).await, Progress { booked: 2, total: 2 });

    let rows = engine.participant_bookings(p).await;
    let starts: Vec<Option<Ms>> = rows.iter().map(|r| r.start).collect();
    assert_eq!(starts, vec![Some(NOW + 5 * H), Some(NOW + 3 * H), Some(NOW + H)]);
    assert_eq!(rows[2].status, BookingStatus::Cancelled);
    assert_eq!(rows[1].service_name, "Baseline MRI");

    // Deleting the cancelled booking's slot leaves the history row without times.
    engine.delete_slot(s_us).await.unwrap();
    let rows = engine.participant_bookings(p).await;
    assert_eq!(rows.last().unwrap().start, None);
    assert!(engine.participant_bookings(Ulid::new()).await.is_empty());
}

#[tokio::test]
async fn slot_overview_lists_holders() {
    let (engine, service_id) = engine_with_service("overview.wal").await;
    let shared = Ulid::new();
    engine.create_slot(shared, service_id, NOW + 2 * H, 2).await.unwrap();
    let early = slot(&engine, service_id, NOW + H).await;

    let p = Ulid::new();
    engine.register_participant(p, "anna@example.org".into()).await.unwrap();
    engine.create_booking(Ulid::new(), p, service_id, shared, NOW).await.unwrap();

    let rows = engine.slot_overview().await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].slot_id, early);
    assert_eq!(rows[0].booked, 0);
    assert_eq!(rows[1].slot_id, shared);
    assert_eq!(rows[1].booked, 1);
    assert_eq!(rows[1].capacity, 2);
    assert_eq!(rows[1].holder_emails, vec!["anna@example.org".to_string()]);
}

#[tokio::test]
async fn register_participant_updates_address() {
    let engine = Engine::new(test_wal_path("participant_update.wal")).unwrap();
    let p = Ulid::new();
    engine.register_participant(p, "old@example.org".into()).await.unwrap();
    engine.register_participant(p, "new@example.org".into()).await.unwrap();
    assert_eq!(engine.tables.read().await.participants[&p].email, "new@example.org");
    assert!(matches!(
        engine.register_participant(p, "broken".into()).await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_replay() {
    let path = test_wal_path("replay.wal");
    let service_id = Ulid::new();
    let (s1, s2) = (Ulid::new(), Ulid::new());
    let (kept, cancelled) = (Ulid::new(), Ulid::new());
    let p = Ulid::new();
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .create_service(service_id, "Baseline US".into(), Modality::Ultrasound, VisitPhase::Baseline)
            .await
            .unwrap();
        engine.register_participant(p, "p@example.org".into()).await.unwrap();
        engine.create_slot(s1, service_id, NOW + H, 1).await.unwrap();
        engine.create_slot(s2, service_id, NOW + 2 * H, 1).await.unwrap();
        engine.create_booking(cancelled, Ulid::new(), service_id, s1, NOW).await.unwrap();
        engine.cancel_booking(cancelled, NOW).await.unwrap();
        engine.create_booking(kept, p, service_id, s1, NOW).await.unwrap();
        engine.mark_reminder_sent(kept, s1, NOW).await.unwrap();
        engine.reschedule_booking(kept, s2, NOW).await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let b = engine.get_booking(kept).await.unwrap();
    assert_eq!(b.slot_id, s2);
    assert_eq!(b.reminder_sent_at, None);
    assert_eq!(
        engine.get_booking(cancelled).await.unwrap().status,
        BookingStatus::Cancelled
    );
    // Indexes rebuilt: s1 free, s2 held, p still holds the service.
    let free: Vec<Ulid> = engine
        .available_slots(service_id, NOW)
        .await
        .iter()
        .map(|a| a.slot_id)
        .collect();
    assert_eq!(free, vec![s1]);
    assert!(matches!(
        engine.create_booking(Ulid::new(), p, service_id, s1, NOW).await,
        Err(EngineError::DuplicateActiveBookingForService { .. })
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let service_id = Ulid::new();
    let s = Ulid::new();
    let b = Ulid::new();
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .create_service(service_id, "Followup MRI".into(), Modality::Mri, VisitPhase::Followup)
            .await
            .unwrap();
        engine.create_slot(s, service_id, NOW + H, 1).await.unwrap();
        // Churn: book and cancel repeatedly.
        for _ in 0..10 {
            let id = Ulid::new();
            engine.create_booking(id, Ulid::new(), service_id, s, NOW).await.unwrap();
            engine.cancel_booking(id, NOW).await.unwrap();
        }
        engine.create_booking(b, Ulid::new(), service_id, s, NOW).await.unwrap();
        engine.mark_reminder_sent(b, s, NOW + 7).await.unwrap();
        engine.set_service_active(service_id, false).await.unwrap();

        assert!(engine.wal_appends_since_compact().await.unwrap() > 20);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await.unwrap(), 0);
    }

    let engine = Engine::new(path).unwrap();
    let booking = engine.get_booking(b).await.unwrap();
    assert_eq!(booking.reminder_sent_at, Some(NOW + 7));
    assert_eq!(booking.status, BookingStatus::Booked);
    assert_eq!(engine.tables.read().await.bookings.len(), 11);
    assert!(engine.list_services(false).await.is_empty());
    assert_eq!(engine.delete_slot(s).await, Err(EngineError::SlotHasActiveBooking(s)));
}

#[tokio::test]
async fn compaction_keeps_holder_index_when_active_id_sorts_first() {
    let path = test_wal_path("compaction_holder.wal");
    let service_id = Ulid::new();
    let (s1, s2, s3) = (Ulid::new(), Ulid::new(), Ulid::new());
    let p = Ulid::new();
    let active = Ulid::from_parts(1, 0);
    let cancelled = Ulid::from_parts(2, 0);
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .create_service(service_id, "Baseline US".into(), Modality::Ultrasound, VisitPhase::Baseline)
            .await
            .unwrap();
        for (i, s) in [s1, s2, s3].into_iter().enumerate() {
            engine.create_slot(s, service_id, NOW + (i as i64 + 1) * H, 1).await.unwrap();
        }
        engine.create_booking(cancelled, p, service_id, s1, NOW).await.unwrap();
        engine.cancel_booking(cancelled, NOW).await.unwrap();
        engine.create_booking(active, p, service_id, s2, NOW).await.unwrap();
        engine.compact_wal().await.unwrap();
    }

    let engine = Engine::new(path).unwrap();
    assert!(matches!(
        engine.create_booking(Ulid::new(), p, service_id, s3, NOW).await,
        Err(EngineError::DuplicateActiveBookingForService { .. })
    ));
    assert_eq!(engine.delete_slot(s2).await, Err(EngineError::SlotHasActiveBooking(s2)));
}

#[tokio::test]
async fn dead_wal_writer_is_reported() {
    let (wal_tx, wal_rx) = tokio::sync::mpsc::channel(1);
    drop(wal_rx);
    let engine = Engine {
        tables: tokio::sync::RwLock::new(Tables::new()),
        wal_tx,
    };

    assert!(matches!(
        engine.wal_appends_since_compact().await,
        Err(EngineError::WalError(_))
    ));
    assert!(matches!(
        engine.register_participant(Ulid::new(), "p@example.org".into()).await,
        Err(EngineError::WalError(_))
    ));
}
