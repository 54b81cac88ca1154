//! Idempotent event consumers.
//!
//! Every consumer is the same pipeline around a small handler:
//!
//! ```text
//! delivery ─▶ decode ─▶ ledger has (eventId, consumer)? ─yes─▶ Ack (deduplicated)
//!                │                    │ no
//!                │ malformed          ▼
//!                ▼            handler.side_effect(event)
//!           DeadLetter                │
//!                                     ▼
//!                      apply_once(ledger row + effect) ─▶ Ack (applied)
//!                                     │
//!                    transient error ─┴─ permanent error / panic
//!                          ▼                    ▼
//!                       Requeue             DeadLetter
//! ```
//!
//! The ledger check before building the effect is only a fast path; the
//! guarantee comes from [`IdempotencyLedger::apply_once`], which rejects a
//! concurrent duplicate at the storage layer.
//!
//! [`ConsumerPool`] runs several workers against one queue. Workers compete
//! for deliveries, finish the delivery in hand when shutdown is signalled, and
//! re-subscribe with backoff when their delivery stream ends.

use crate::metrics::ConsumerMetrics;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use parkflow_core::broker::{AckDecision, Broker, BrokerError, Delivery};
use parkflow_core::environment::Clock;
use parkflow_core::event::{DomainEvent, EventType};
use parkflow_core::model::ProcessingLedgerEntry;
use parkflow_core::store::{ApplyOutcome, IdempotencyLedger, SideEffect, StoreError};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Why a handler could not process an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Retrying will not help; the message goes to the dead-letter queue
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Retrying later may succeed; the message is requeued
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl From<StoreError> for HandlerError {
    fn from(error: StoreError) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

/// Business half of a consumer.
#[async_trait]
pub trait IdempotentHandler: Send + Sync {
    /// Name recorded in the processing ledger. Stable across releases.
    fn consumer_name(&self) -> &str;

    /// The only event type this handler accepts.
    fn event_type(&self) -> EventType;

    /// The write to apply, atomically with the ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Permanent`] for events that can never be applied.
    fn side_effect(&self, event: &DomainEvent) -> Result<SideEffect, HandlerError>;

    /// Called after the effect was committed for the first time.
    async fn on_applied(&self, _event: &DomainEvent, _outcome: &ApplyOutcome) {}
}

/// What happened to a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Already processed by this consumer; acknowledged without side effects
    Deduplicated,
    /// Effect committed; acknowledged
    Applied,
    /// Transient failure; requeued
    Requeued,
    /// Permanent failure, malformed body, or handler panic; dead-lettered
    DeadLettered,
}

impl Disposition {
    /// The settlement sent to the broker.
    #[must_use]
    pub const fn ack_decision(self) -> AckDecision {
        match self {
            Self::Deduplicated | Self::Applied => AckDecision::Ack,
            Self::Requeued => AckDecision::Requeue,
            Self::DeadLettered => AckDecision::DeadLetter,
        }
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deduplicated => "deduplicated",
            Self::Applied => "applied",
            Self::Requeued => "requeued",
            Self::DeadLettered => "dead_lettered",
        }
    }
}

/// Decodes, deduplicates and applies deliveries for one handler.
pub struct MessageProcessor {
    ledger: Arc<dyn IdempotencyLedger>,
    handler: Arc<dyn IdempotentHandler>,
    clock: Arc<dyn Clock>,
}

impl MessageProcessor {
    /// Processor for `handler`, recording into `ledger`.
    #[must_use]
    pub fn new(
        ledger: Arc<dyn IdempotencyLedger>,
        handler: Arc<dyn IdempotentHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            handler,
            clock,
        }
    }

    /// Ledger name of the wrapped handler.
    #[must_use]
    pub fn consumer_name(&self) -> &str {
        self.handler.consumer_name()
    }

    /// Process a delivery and settle it with the broker.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the settlement could not be sent. The
    /// broker then redelivers the message and the ledger absorbs the repeat.
    pub async fn process(&self, broker: &dyn Broker, delivery: Delivery) -> Result<Disposition, BrokerError> {
        let disposition = self.decide(&delivery).await;
        broker
            .settle(&delivery.queue, delivery.metadata.delivery_tag, disposition.ack_decision())
            .await?;
        ConsumerMetrics::record_disposition(self.consumer_name(), disposition.as_str());
        Ok(disposition)
    }

    /// Process a delivery without settling it.
    pub async fn decide(&self, delivery: &Delivery) -> Disposition {
        let consumer = self.consumer_name();

        let event = match self.decode(delivery) {
            Ok(event) => event,
            Err(reason) => {
                tracing::error!(
                    consumer,
                    queue = %delivery.queue,
                    message_id = %delivery.message_id,
                    routing_key = %delivery.routing_key,
                    reason = %reason,
                    "Undecodable message, dead-lettering"
                );
                return Disposition::DeadLettered;
            }
        };

        match AssertUnwindSafe(self.apply(&event)).catch_unwind().await {
            Ok(Ok(disposition)) => disposition,
            Ok(Err(HandlerError::Transient(reason))) => {
                tracing::warn!(
                    consumer,
                    event_id = %event.event_id,
                    delivery_count = delivery.delivery_count(),
                    reason = %reason,
                    "Transient failure, requeueing"
                );
                Disposition::Requeued
            }
            Ok(Err(HandlerError::Permanent(reason))) => {
                tracing::error!(
                    consumer,
                    event_id = %event.event_id,
                    reason = %reason,
                    "Permanent failure, dead-lettering"
                );
                Disposition::DeadLettered
            }
            Err(_) => {
                tracing::error!(
                    consumer,
                    event_id = %event.event_id,
                    "Handler panicked, dead-lettering"
                );
                Disposition::DeadLettered
            }
        }
    }

    fn decode(&self, delivery: &Delivery) -> Result<DomainEvent, String> {
        let expected = self.handler.event_type();
        let actual = EventType::from_routing_key(&delivery.routing_key).map_err(|e| e.to_string())?;
        if actual != expected {
            return Err(format!("expected {expected}, received {actual}"));
        }
        DomainEvent::from_body(expected, &delivery.body, delivery.correlation_id.clone())
            .map_err(|e| e.to_string())
    }

    async fn apply(&self, event: &DomainEvent) -> Result<Disposition, HandlerError> {
        let consumer = self.consumer_name();

        if self.ledger.is_processed(event.event_id, consumer).await? {
            tracing::debug!(consumer, event_id = %event.event_id, "Duplicate delivery skipped");
            return Ok(Disposition::Deduplicated);
        }

        let effect = self.handler.side_effect(event)?;
        let entry = ProcessingLedgerEntry {
            event_id: event.event_id,
            consumer_name: consumer.to_string(),
            processed_at: self.clock.now(),
        };

        match self.ledger.apply_once(entry, effect).await? {
            ApplyOutcome::AlreadyProcessed => {
                tracing::debug!(consumer, event_id = %event.event_id, "Lost race to a concurrent duplicate");
                Ok(Disposition::Deduplicated)
            }
            outcome => {
                tracing::info!(
                    consumer,
                    event_id = %event.event_id,
                    correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
                    already_satisfied = outcome == ApplyOutcome::AlreadySatisfied,
                    "Event applied"
                );
                self.handler.on_applied(event, &outcome).await;
                Ok(Disposition::Applied)
            }
        }
    }
}

/// Competing workers for one queue.
pub struct ConsumerPool {
    broker: Arc<dyn Broker>,
    queue: String,
    processor: Arc<MessageProcessor>,
    workers: usize,
    reconnect: RetryPolicy,
}

impl ConsumerPool {
    /// One worker for `queue`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, processor: MessageProcessor) -> Self {
        Self {
            broker,
            queue: queue.into(),
            processor: Arc::new(processor),
            workers: 1,
            reconnect: RetryPolicy::builder()
                .initial_delay(std::time::Duration::from_millis(200))
                .max_delay(std::time::Duration::from_secs(10))
                .build(),
        }
    }

    /// Number of concurrent workers (at least one).
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Backoff between re-subscription attempts.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Start the workers. They stop when `shutdown` fires.
    #[must_use]
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            queue = %self.queue,
            consumer = self.processor.consumer_name(),
            workers = self.workers,
            "Starting consumer pool"
        );

        (0..self.workers)
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    broker: Arc::clone(&self.broker),
                    queue: self.queue.clone(),
                    processor: Arc::clone(&self.processor),
                    reconnect: self.reconnect.clone(),
                };
                tokio::spawn(worker.run(shutdown.subscribe()))
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    broker: Arc<dyn Broker>,
    queue: String,
    processor: Arc<MessageProcessor>,
    reconnect: RetryPolicy,
}

impl Worker {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt = 0;

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.recv() => break,
                result = self.broker.consume(&self.queue) => result,
            };

            match subscribed {
                Ok(mut deliveries) => {
                    attempt = 0;
                    tracing::debug!(worker = self.id, queue = %self.queue, "Subscribed");
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => {
                                tracing::debug!(worker = self.id, queue = %self.queue, "Worker stopped");
                                return;
                            }
                            next = deliveries.next() => match next {
                                Some(Ok(delivery)) => self.handle(delivery).await,
                                Some(Err(e)) => {
                                    tracing::warn!(worker = self.id, queue = %self.queue, error = %e, "Delivery stream error");
                                }
                                None => {
                                    tracing::warn!(worker = self.id, queue = %self.queue, "Delivery stream ended, re-subscribing");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(worker = self.id, queue = %self.queue, error = %e, attempt, "Failed to subscribe");
                }
            }

            let delay = self.reconnect.backoff(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(worker = self.id, queue = %self.queue, "Worker stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let message_id = delivery.message_id;
        if let Err(e) = self.processor.process(self.broker.as_ref(), delivery).await {
            tracing::error!(
                worker = self.id,
                queue = %self.queue,
                message_id = %message_id,
                error = %e,
                "Failed to settle delivery; broker will redeliver"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions_map_to_settlements() {
        assert_eq!(Disposition::Applied.ack_decision(), AckDecision::Ack);
        assert_eq!(Disposition::Deduplicated.ack_decision(), AckDecision::Ack);
        assert_eq!(Disposition::Requeued.ack_decision(), AckDecision::Requeue);
        assert_eq!(Disposition::DeadLettered.ack_decision(), AckDecision::DeadLetter);
    }

    #[test]
    fn store_errors_classify() {
        assert!(matches!(
            HandlerError::from(StoreError::Unavailable("pool".into())),
            HandlerError::Transient(_)
        ));
        assert!(matches!(
            HandlerError::from(StoreError::Corrupt("row".into())),
            HandlerError::Permanent(_)
        ));
        assert!(matches!(
            HandlerError::from(StoreError::Database("syntax error".into())),
            HandlerError::Permanent(_)
        ));
    }

    #[test]
    fn handler_and_store_agree_on_transience() {
        let errors = [
            StoreError::Unavailable("pool".into()),
            StoreError::Conflict("dup".into()),
            StoreError::Corrupt("row".into()),
            StoreError::Database("syntax error".into()),
        ];
        for error in errors {
            let transient = error.is_transient();
            assert_eq!(matches!(HandlerError::from(error), HandlerError::Transient(_)), transient);
        }
    }
}
