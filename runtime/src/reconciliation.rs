//! Outbox reconciliation.
//!
//! Events are recorded in the outbox in the same transaction as the state
//! change that produced them. The publisher sends them right after commit,
//! but a send can fail, a confirm can be a nack or a return, and the process
//! can crash in between. [`ReconciliationSweep`] periodically republishes
//! every outbox row that is failed, or still pending after a grace period,
//! reusing the stored `eventId` so consumers deduplicate the repeat.

use crate::metrics::OutboxMetrics;
use crate::publisher::EventPublisher;
use chrono::Duration as ChronoDuration;
use parkflow_core::environment::Clock;
use parkflow_core::store::{Outbox, StoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows considered
    pub due: usize,
    /// Rows handed to the broker again
    pub republished: usize,
    /// Rows whose republish failed; they stay due
    pub failed: usize,
}

/// Periodically republishes unconfirmed outbox events.
pub struct ReconciliationSweep {
    outbox: Arc<dyn Outbox>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    interval: Duration,
    grace: Duration,
    max_attempts: u32,
    batch: usize,
}

impl ReconciliationSweep {
    /// Sweep with a 30 second interval, 60 second grace, 10 attempts and batches of 100.
    #[must_use]
    pub fn new(outbox: Arc<dyn Outbox>, publisher: EventPublisher, clock: Arc<dyn Clock>) -> Self {
        Self {
            outbox,
            publisher,
            clock,
            interval: Duration::from_secs(30),
            grace: Duration::from_secs(60),
            max_attempts: 10,
            batch: 100,
        }
    }

    /// Time between sweeps.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// How long a pending row may wait for its confirm before it is republished.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Rows with this many attempts are left for an operator.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Republish every due row once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the outbox cannot be read.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let grace = ChronoDuration::from_std(self.grace).unwrap_or(ChronoDuration::MAX);
        let pending_before = self
            .clock
            .now()
            .checked_sub_signed(grace)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let due = self
            .outbox
            .due_for_replay(pending_before, self.max_attempts, self.batch)
            .await?;

        let mut report = SweepReport {
            due: due.len(),
            ..SweepReport::default()
        };

        for entry in due {
            let event_id = entry.event.event_id;
            self.outbox.record_attempt(event_id).await?;

            match self.publisher.send(&entry.event).await {
                Ok(()) => {
                    report.republished += 1;
                    OutboxMetrics::record_replay();
                    tracing::info!(
                        event_id = %event_id,
                        event_type = %entry.event.event_type(),
                        attempt = entry.attempts + 1,
                        previous_status = entry.status.as_str(),
                        "Republished outbox event"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(event_id = %event_id, error = %e, "Outbox republish failed");
                    self.outbox.mark_failed(event_id, &e.to_string()).await?;
                }
            }
        }

        Ok(report)
    }

    /// Sweep every interval until `shutdown` fires.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(interval_secs = self.interval.as_secs(), "Outbox reconciliation started");

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => match self.run_once().await {
                        Ok(report) if report.due > 0 => {
                            tracing::info!(due = report.due, republished = report.republished, failed = report.failed, "Outbox sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Outbox sweep failed"),
                    },
                }
            }

            tracing::info!("Outbox reconciliation stopped");
        })
    }
}
