mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::available_slots;
pub use error::EngineError;
pub use queries::{ReminderCandidate, ReminderScan};
pub use store::{ConstraintViolation, Tables};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::*;
use crate::wal::Wal;

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

/// Owns the WAL. Every append that is already queued when the first one
/// arrives joins the same batch and shares a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-buffered frame leaks into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
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

/// The ledger of one study: services, participants, slots and bookings.
///
/// All tables sit behind one async `RwLock`. A mutation holds the write
/// guard from its first read through the WAL append and the in-memory
/// apply, so validation and write form one isolated transaction. Readers
/// take the read guard and see a single consistent snapshot.
pub struct Engine {
    pub(super) tables: RwLock<Tables>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tables = Tables::new();
        for event in &events {
            tables.apply(event);
        }
        tracing::debug!("replayed {} events from {}", events.len(), wal_path.display());

        Ok(Self {
            tables: RwLock::new(tables),
            wal_tx,
        })
    }

    async fn wal_request<T>(
        &self,
        cmd: WalCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Durably log `event`, then apply it. The caller holds the write guard.
    pub(super) async fn commit(&self, tables: &mut Tables, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_request(
            WalCommand::Append {
                event: event.clone(),
                response: tx,
            },
            rx,
        )
        .await?
        .map_err(|e| EngineError::WalError(e.to_string()))?;
        tables.apply(&event);
        Ok(())
    }

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Read guard for the whole compaction: no commit can land between the
        // snapshot and the swap, so nothing is lost from the rewritten log.
        let tables = self.tables.read().await;
        let events = snapshot_events(&tables);
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::Compact { events, response: tx }, rx)
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Appends since the last compaction. Fails when the WAL writer is gone.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_request(WalCommand::AppendsSinceCompact { response: tx }, rx)
            .await
    }
}

/// Events that recreate `tables` exactly, in dependency order.
fn snapshot_events(tables: &Tables) -> Vec<Event> {
    let mut events = Vec::new();

    let mut services: Vec<&Service> = tables.services.values().collect();
    services.sort_by_key(|s| s.id);
    for s in services {
        events.push(Event::ServiceCreated {
            id: s.id,
            name: s.name.clone(),
            modality: s.modality,
            visit_phase: s.visit_phase,
        });
        if !s.active {
            events.push(Event::ServiceActiveSet { id: s.id, active: false });
        }
    }

    let mut participants: Vec<&Participant> = tables.participants.values().collect();
    participants.sort_by_key(|p| p.id);
    events.extend(participants.into_iter().map(|p| Event::ParticipantRegistered {
        id: p.id,
        email: p.email.clone(),
    }));

    let mut slots: Vec<&Slot> = tables.slots.values().collect();
    slots.sort_by_key(|s| s.id);
    events.extend(slots.into_iter().map(|s| Event::SlotCreated {
        id: s.id,
        service_id: s.service_id,
        span: s.span,
        capacity: s.capacity,
    }));

    // Cancelled bookings first: each is created and cancelled before any
    // active booking claims the same (participant, service) index entry.
    let mut bookings: Vec<&Booking> = tables.bookings.values().collect();
    bookings.sort_by_key(|b| (b.is_active(), b.id));
    for b in bookings {
        events.push(Event::BookingCreated {
            id: b.id,
            participant_id: b.participant_id,
            service_id: b.service_id,
            slot_id: b.slot_id,
            at: b.created_at,
        });
        if let Some(at) = b.cancelled_at {
            events.push(Event::BookingCancelled { id: b.id, at });
        }
        if let Some(at) = b.reminder_sent_at {
            events.push(Event::ReminderMarked {
                id: b.id,
                slot_id: b.slot_id,
                at,
            });
        }
    }

    events
}
