//! Message broker abstraction with manual acknowledgement.
//!
//! The [`Broker`] trait models an AMQP-style broker: topic exchanges route
//! messages to durable queues, consumers settle every delivery explicitly, and
//! publish outcomes arrive asynchronously as [`PublishConfirm`]s.
//!
//! # Delivery lifecycle
//!
//! ```text
//! publish ──▶ exchange ──▶ queue ──▶ consume ──▶ settle(tag, decision)
//!                 │                                  │
//!                 │ no binding                       ├─ Ack        → removed
//!                 ▼                                  ├─ Requeue    → redelivered (attempt + 1)
//!          PublishConfirm::Returned                  └─ DeadLetter → dead-letter exchange
//! ```
//!
//! A queue declared with a delivery limit dead-letters a message on the
//! requeue that would exceed the limit, so a message that keeps failing
//! transiently still ends up in the dead-letter queue.
//!
//! # Implementations
//!
//! - `InMemoryBroker` in `parkflow-testing` - for tests and single-process runs
//! - `RedpandaBroker` in `parkflow-redpanda` - for Kafka-compatible deployments

use crate::event::{DomainEvent, EventError};
use crate::topology::Topology;
use futures::Stream;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Header carrying the event type name.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Header counting earlier failed deliveries of a message.
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Header naming the queue a dead-lettered message was rejected from.
pub const DEATH_QUEUE_HEADER: &str = "x-first-death-queue";

/// Header giving the reason a message was dead-lettered (`rejected` or `delivery-limit`).
pub const DEATH_REASON_HEADER: &str = "x-first-death-reason";

/// Header preserving the routing key a dead-lettered message was originally published with.
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Broker cannot be reached
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Topology declaration was rejected
    #[error("Topology declaration failed: {0}")]
    DeclarationFailed(String),

    /// Publish was not accepted
    #[error("Publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    PublishFailed {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// Why it failed
        reason: String,
    },

    /// Queue has not been declared
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Exchange has not been declared
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// Delivery tag is not outstanding on this queue (already settled or never delivered)
    #[error("Unknown delivery {delivery_tag} on queue '{queue}'")]
    UnknownDelivery {
        /// Queue name
        queue: String,
        /// Tag passed to settle
        delivery_tag: u64,
    },

    /// Connection or channel closed
    #[error("Broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::PublishFailed { .. } | Self::Closed
        )
    }
}

/// A message ready to be published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Exchange to publish to
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Broker-level message id; the event id for domain events, echoed in confirms
    pub message_id: Uuid,
    /// Correlation id of the originating request
    pub correlation_id: Option<String>,
    /// MIME type of `body`
    pub content_type: String,
    /// Application headers
    pub headers: BTreeMap<String, String>,
    /// Payload
    pub body: Vec<u8>,
    /// Report the message as returned when no queue is bound for the key
    pub mandatory: bool,
}

impl OutboundMessage {
    /// Build the message for a stamped domain event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the body cannot be encoded.
    pub fn for_event(exchange: &str, event: &DomainEvent) -> Result<Self, EventError> {
        let mut headers = BTreeMap::new();
        headers.insert(EVENT_TYPE_HEADER.to_string(), event.event_type().as_str().to_string());

        Ok(Self {
            exchange: exchange.to_string(),
            routing_key: event.routing_key().to_string(),
            message_id: event.event_id,
            correlation_id: event.correlation_id.clone(),
            content_type: "application/json".to_string(),
            headers,
            body: event.to_body()?,
            mandatory: true,
        })
    }
}

/// Per-delivery acknowledgement data. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Handle used to settle this delivery
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// A message received from a queue, awaiting settlement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    /// Acknowledgement data
    pub metadata: DeliveryMetadata,
    /// Queue the message was taken from
    pub queue: String,
    /// Exchange it was published to
    pub exchange: String,
    /// Routing key it was published with
    pub routing_key: String,
    /// Broker-level message id
    pub message_id: Uuid,
    /// Correlation id of the originating request
    pub correlation_id: Option<String>,
    /// Application headers
    pub headers: BTreeMap<String, String>,
    /// Payload, exactly as published
    pub body: Vec<u8>,
}

impl Delivery {
    /// Number of earlier deliveries that were requeued.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }
}

/// How a consumer settles a delivery. Exactly one decision per delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AckDecision {
    /// Processed (or already processed); remove from the queue
    Ack,
    /// Transient failure; deliver again
    Requeue,
    /// Permanent failure; route to the queue's dead-letter target
    DeadLetter,
}

impl AckDecision {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// Asynchronous outcome of a publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishConfirm {
    /// Broker accepted responsibility for the message
    Acked {
        /// Message id of the publish
        message_id: Uuid,
    },
    /// Broker refused the message
    Nacked {
        /// Message id of the publish
        message_id: Uuid,
        /// Broker-supplied reason
        reason: String,
    },
    /// No queue is bound for the routing key; the message was dropped
    Returned {
        /// Message id of the publish
        message_id: Uuid,
        /// Exchange published to
        exchange: String,
        /// Routing key that matched nothing
        routing_key: String,
        /// Broker reply text
        reply_text: String,
    },
}

impl PublishConfirm {
    /// Message id the outcome refers to.
    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        match self {
            Self::Acked { message_id }
            | Self::Nacked { message_id, .. }
            | Self::Returned { message_id, .. } => *message_id,
        }
    }
}

/// Boxed future returned by [`Broker`] methods.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from one queue.
///
/// Errors are surfaced in-band so a consumer can log them and keep reading;
/// the stream ends when the connection is closed.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Message broker with topic routing, manual acknowledgement and publisher confirms.
///
/// Methods return boxed futures so the trait stays dyn-compatible and can be
/// shared as `Arc<dyn Broker>`.
pub trait Broker: Send + Sync {
    /// Declare exchanges, queues and bindings. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::DeclarationFailed`] if the topology is invalid or
    /// conflicts with what is already declared.
    fn declare<'a>(&'a self, topology: &'a Topology) -> BrokerFuture<'a, ()>;

    /// Submit a message to an exchange.
    ///
    /// Returns once the broker has taken the message. Whether it was confirmed
    /// or returned as unroutable is reported through [`Broker::confirms`].
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached or the exchange is unknown.
    fn publish(&self, message: OutboundMessage) -> BrokerFuture<'_, ()>;

    /// Subscribe to publish outcomes.
    fn confirms(&self) -> broadcast::Receiver<PublishConfirm>;

    /// Start consuming a queue. Each delivery must later be settled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownQueue`] if the queue was never declared.
    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream>;

    /// Settle a delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownDelivery`] if the tag is not outstanding.
    fn settle<'a>(
        &'a self,
        queue: &'a str,
        delivery_tag: u64,
        decision: AckDecision,
    ) -> BrokerFuture<'a, ()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrokerError::Unreachable("down".into()).is_transient());
        assert!(BrokerError::Closed.is_transient());
        assert!(!BrokerError::UnknownQueue("q".into()).is_transient());
        assert!(!BrokerError::DeclarationFailed("bad".into()).is_transient());
    }

    #[test]
    fn delivery_count_defaults_to_zero() {
        let mut delivery = Delivery {
            metadata: DeliveryMetadata {
                delivery_tag: 1,
                redelivered: false,
            },
            queue: "q".into(),
            exchange: "x".into(),
            routing_key: "k".into(),
            message_id: Uuid::new_v4(),
            correlation_id: None,
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        assert_eq!(delivery.delivery_count(), 0);
        delivery.headers.insert(DELIVERY_COUNT_HEADER.into(), "3".into());
        assert_eq!(delivery.delivery_count(), 3);
    }
}
