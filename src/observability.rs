use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "studyslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "studyslot_query_duration_seconds";

// ── Ledger outcomes ─────────────────────────────────────────────

/// Counter: ledger mutations rejected with a user-actionable outcome. Labels: reason.
pub const LEDGER_REJECTIONS_TOTAL: &str = "studyslot_ledger_rejections_total";

/// Counter: reminders sent and marked.
pub const REMINDERS_SENT_TOTAL: &str = "studyslot_reminders_sent_total";

/// Counter: reminder sends that failed or timed out (retried next run).
pub const REMINDERS_FAILED_TOTAL: &str = "studyslot_reminders_failed_total";

/// Counter: reminder candidates skipped (integrity failures, lost marks).
pub const REMINDERS_SKIPPED_TOTAL: &str = "studyslot_reminders_skipped_total";

/// Histogram: reminder run duration in seconds.
pub const REMINDER_RUN_DURATION_SECONDS: &str = "studyslot_reminder_run_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "studyslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "studyslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "studyslot_connections_rejected_total";

/// Gauge: number of loaded studies.
pub const STUDIES_ACTIVE: &str = "studyslot_studies_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "studyslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "studyslot_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "studyslot_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertService { .. } => "insert_service",
        Command::SetServiceActive { .. } => "set_service_active",
        Command::InsertParticipant { .. } => "insert_participant",
        Command::InsertSlot { .. } => "insert_slot",
        Command::DeleteSlot { .. } => "delete_slot",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::SelectAvailableSlots { .. } => "select_available_slots",
        Command::SelectServices { .. } => "select_services",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectProgress { .. } => "select_progress",
        Command::SelectSlotOverview => "select_slot_overview",
    }
}
