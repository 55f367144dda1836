use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{Engine, ReminderCandidate};
use crate::mailer::Mailer;
use crate::model::{now_ms, Ms};
use crate::observability::{
    REMINDERS_FAILED_TOTAL, REMINDERS_SENT_TOTAL, REMINDERS_SKIPPED_TOTAL,
    REMINDER_RUN_DURATION_SECONDS, WAL_COMPACTIONS_TOTAL,
};

pub const REMINDER_SUBJECT: &str = "Reminder: study appointment";

#[derive(Debug, Clone)]
pub struct ReminderSettings {
    /// Lookahead: bookings whose slot starts in `(now, now + window]` are due.
    pub window: Duration,
    /// Upper bound for a single send. A send that overruns counts as failed.
    pub send_timeout: Duration,
    /// Base URL of the participant dashboard, without trailing slash.
    pub app_base_url: Option<String>,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
            send_timeout: Duration::from_secs(10),
            app_base_url: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub sent: usize,
    /// Send errors, send timeouts and failed marks. Retried on the next run.
    pub failed: usize,
    /// Bookings with a broken cross-reference, and sends whose mark lost to
    /// a concurrent cancel or reschedule.
    pub skipped: usize,
}

/// Sends one reminder per (booking, slot) assignment.
pub struct ReminderDispatcher {
    engine: Arc<Engine>,
    mailer: Arc<dyn Mailer>,
    settings: ReminderSettings,
    running: Mutex<()>,
}

impl ReminderDispatcher {
    pub fn new(engine: Arc<Engine>, mailer: Arc<dyn Mailer>, settings: ReminderSettings) -> Self {
        Self {
            engine,
            mailer,
            settings,
            running: Mutex::new(()),
        }
    }

    /// One dispatch pass at `now`. Returns `None` when another pass on this
    /// dispatcher is still in flight.
    ///
    /// Candidates are read from one snapshot and the ledger lock is released
    /// before any mail goes out. Each successful send is followed by a mark
    /// conditioned on the booking still holding the same slot.
    pub async fn run(&self, now: Ms) -> Option<DispatchReport> {
        let Ok(_guard) = self.running.try_lock() else {
            debug!("reminder run still in progress, skipping");
            return None;
        };
        let started = Instant::now();

        let window = self.settings.window.as_millis() as Ms;
        let scan = self.engine.reminder_candidates(now, window).await;
        let mut report = DispatchReport {
            skipped: scan.integrity_failures,
            ..DispatchReport::default()
        };

        for candidate in &scan.candidates {
            if !self.deliver(candidate).await {
                report.failed += 1;
                continue;
            }
            match self
                .engine
                .mark_reminder_sent(candidate.booking_id, candidate.slot_id, now)
                .await
            {
                Ok(true) => report.sent += 1,
                Ok(false) => {
                    debug!(
                        booking_id = %candidate.booking_id,
                        "booking changed while its reminder was in flight, not marked"
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(booking_id = %candidate.booking_id, "failed to mark reminder: {e}");
                    report.failed += 1;
                }
            }
        }

        metrics::counter!(REMINDERS_SENT_TOTAL).increment(report.sent as u64);
        metrics::counter!(REMINDERS_FAILED_TOTAL).increment(report.failed as u64);
        metrics::counter!(REMINDERS_SKIPPED_TOTAL).increment(report.skipped as u64);
        metrics::histogram!(REMINDER_RUN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report != DispatchReport::default() {
            info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "reminder run finished"
            );
        }
        Some(report)
    }

    /// True when the mailer accepted the message within the send timeout.
    async fn deliver(&self, candidate: &ReminderCandidate) -> bool {
        let body = reminder_body(candidate, self.settings.app_base_url.as_deref());
        let send = self.mailer.send(&candidate.email, REMINDER_SUBJECT, &body);
        match tokio::time::timeout(self.settings.send_timeout, send).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(booking_id = %candidate.booking_id, "reminder send failed: {e}");
                false
            }
            Err(_) => {
                warn!(
                    booking_id = %candidate.booking_id,
                    "reminder send timed out after {:?}",
                    self.settings.send_timeout
                );
                false
            }
        }
    }
}

pub fn reminder_body(candidate: &ReminderCandidate, app_base_url: Option<&str>) -> String {
    let when = chrono::DateTime::from_timestamp_millis(candidate.starts_at)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| candidate.starts_at.to_string());
    let mut body = format!(
        "This is an automatic reminder of your study appointment.\n\n\
         Service: {}\n\
         Time: {when}\n",
        candidate.service_name
    );
    if let Some(base) = app_base_url {
        body.push_str(&format!(
            "\nReschedule or cancel:\n{}/dashboard\n",
            base.trim_end_matches('/')
        ));
    }
    body
}

/// Periodic trigger for one study's dispatcher.
pub async fn run_dispatcher(dispatcher: Arc<ReminderDispatcher>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let dispatcher = dispatcher.clone();
        // A tick that lands while a run is in flight is a no-op.
        tokio::spawn(async move {
            dispatcher.run(now_ms()).await;
        });
    }
}

/// Background task that rewrites the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = match engine.wal_appends_since_compact().await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("WAL compaction check failed: {e}");
                continue;
            }
        };
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
