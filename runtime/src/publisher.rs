//! Event publisher and publish-confirm listener.
//!
//! [`EventPublisher`] stamps a draft once (assigning `eventId` and
//! `emittedAt` if absent) and hands it to the broker. Transient broker
//! failures are retried with the *same* stamped event, so a retried publish
//! never mints a new identity. A failure that survives the retries is returned
//! to the caller, whose own commit decision is unaffected.
//!
//! Whether the broker actually took responsibility for a message is learned
//! later: [`ConfirmListener`] watches [`PublishConfirm`]s, logs nacks and
//! unroutable returns as operational errors, and records the outcome in the
//! outbox so the reconciliation sweep can republish what was lost.

use crate::metrics::PublisherMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use parkflow_core::broker::{Broker, BrokerError, OutboundMessage, PublishConfirm};
use parkflow_core::environment::Clock;
use parkflow_core::event::{DomainEvent, EventDraft, EventError};
use parkflow_core::store::Outbox;
use parkflow_core::topology::PARKING_EXCHANGE;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Errors returned by [`EventPublisher`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The event could not be encoded
    #[error(transparent)]
    Encode(#[from] EventError),

    /// The broker did not take the message
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes domain events to the parking exchange.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    exchange: String,
    retry: RetryPolicy,
}

impl EventPublisher {
    /// Publisher for the parking exchange with the default retry policy.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            clock,
            exchange: PARKING_EXCHANGE.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy used for transient broker failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Assign any missing identity to `draft`.
    ///
    /// Callers that must persist the event before sending it (outbox) stamp
    /// first, store, then call [`EventPublisher::send`].
    #[must_use]
    pub fn stamp(&self, draft: EventDraft) -> DomainEvent {
        draft.stamp(self.clock.as_ref())
    }

    /// Stamp and send a draft. Returns the stamped event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding fails or the broker keeps refusing
    /// the message after retries.
    pub async fn publish(&self, draft: EventDraft) -> Result<DomainEvent, PublishError> {
        let event = self.stamp(draft);
        self.send(&event).await?;
        Ok(event)
    }

    /// Send an already stamped event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError`] if encoding fails or the broker keeps refusing
    /// the message after retries.
    pub async fn send(&self, event: &DomainEvent) -> Result<(), PublishError> {
        let message = OutboundMessage::for_event(&self.exchange, event)?;

        retry_with_predicate(
            &self.retry,
            || self.broker.publish(message.clone()),
            BrokerError::is_transient,
        )
        .await
        .map_err(|err| {
            tracing::error!(
                event_id = %event.event_id,
                routing_key = event.routing_key(),
                error = %err,
                "Failed to publish event"
            );
            PublishError::Broker(err)
        })?;

        PublisherMetrics::record_publish(event.routing_key());
        tracing::debug!(
            event_id = %event.event_id,
            event_type = %event.event_type(),
            routing_key = event.routing_key(),
            correlation_id = event.correlation_id.as_deref().unwrap_or("-"),
            "Event handed to broker"
        );
        Ok(())
    }
}

/// Number of returned message ids remembered to suppress the ack that follows a return.
const RETURNED_MEMORY: usize = 1024;

/// Consumes publish outcomes: logs them and records them in the outbox.
///
/// A broker reports an unroutable mandatory message as a return followed by
/// an ack; the listener remembers recent returns so that ack does not mark
/// the event confirmed.
pub struct ConfirmListener {
    confirms: broadcast::Receiver<PublishConfirm>,
    outbox: Option<Arc<dyn Outbox>>,
    returned: VecDeque<Uuid>,
    returned_set: HashSet<Uuid>,
}

impl ConfirmListener {
    /// Subscribe to `broker`'s confirms.
    ///
    /// Create the listener before publishing so no outcome is missed.
    #[must_use]
    pub fn new(broker: &dyn Broker, outbox: Option<Arc<dyn Outbox>>) -> Self {
        Self {
            confirms: broker.confirms(),
            outbox,
            returned: VecDeque::new(),
            returned_set: HashSet::new(),
        }
    }

    /// Run until `shutdown` fires or the broker closes.
    #[must_use]
    pub fn spawn(mut self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("Publish confirm listener started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    received = self.confirms.recv() => match received {
                        Ok(confirm) => self.handle(confirm).await,
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Publish confirm listener lagged; outcomes lost, reconciliation will cover them");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            tracing::info!("Publish confirm listener stopped");
        })
    }

    /// Process one outcome.
    pub async fn handle(&mut self, confirm: PublishConfirm) {
        match &confirm {
            PublishConfirm::Acked { message_id } => {
                PublisherMetrics::record_confirm("acked");
                if self.returned_set.remove(message_id) {
                    tracing::debug!(event_id = %message_id, "Broker acked a returned message");
                    return;
                }
                tracing::debug!(event_id = %message_id, "Broker confirmed event");
                if let Some(outbox) = &self.outbox {
                    if let Err(e) = outbox.mark_confirmed(*message_id).await {
                        tracing::warn!(event_id = %message_id, error = %e, "Failed to mark outbox row confirmed");
                    }
                }
            }
            PublishConfirm::Nacked { message_id, reason } => {
                PublisherMetrics::record_confirm("nacked");
                tracing::error!(event_id = %message_id, reason = %reason, "Broker rejected event publish");
                self.mark_failed(*message_id, reason).await;
            }
            PublishConfirm::Returned {
                message_id,
                exchange,
                routing_key,
                reply_text,
            } => {
                PublisherMetrics::record_confirm("returned");
                tracing::error!(
                    event_id = %message_id,
                    exchange = %exchange,
                    routing_key = %routing_key,
                    reply_text = %reply_text,
                    "Event unroutable: no queue bound for routing key"
                );
                self.remember_returned(*message_id);
                self.mark_failed(*message_id, &format!("unroutable: {reply_text}")).await;
            }
        }
    }

    async fn mark_failed(&self, message_id: Uuid, reason: &str) {
        if let Some(outbox) = &self.outbox {
            if let Err(e) = outbox.mark_failed(message_id, reason).await {
                tracing::warn!(event_id = %message_id, error = %e, "Failed to mark outbox row failed");
            }
        }
    }

    fn remember_returned(&mut self, message_id: Uuid) {
        if self.returned_set.insert(message_id) {
            self.returned.push_back(message_id);
        }
        while self.returned.len() > RETURNED_MEMORY {
            if let Some(oldest) = self.returned.pop_front() {
                self.returned_set.remove(&oldest);
            }
        }
    }
}
