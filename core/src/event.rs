//! Domain events and their wire format.
//!
//! Events are facts that already happened. Two types exist:
//!
//! | Type                | Routing key        | Producer        | Consumers                     |
//! |---------------------|--------------------|-----------------|-------------------------------|
//! | `AssignmentCreated` | `parking.assigned` | parking-service | fee-service (fee creation)    |
//! | `FeePaid`           | `fee.paid`         | fee-service     | fee-service (notification)    |
//!
//! # Identity
//!
//! An [`EventDraft`] becomes a [`DomainEvent`] when it is stamped with an
//! `eventId` and `emittedAt`. The stamp happens once; retries of the same
//! logical event reuse the stamped value so consumers can deduplicate on
//! `eventId`.
//!
//! # Wire format
//!
//! The message body is a flat JSON object: `eventId`, the payload fields in
//! camelCase, and `eventTime`. The event type travels as the routing key and
//! the correlation id as a message property.
//!
//! ```json
//! {"eventId":"6f1c…","feeId":100,"userId":7,"parkId":3,
//!  "paymentMonth":"2025-06","paymentAmount":"300.00",
//!  "paymentTime":"2025-06-14T09:30:00Z","eventTime":"2025-06-14T09:30:00Z"}
//! ```

use crate::environment::Clock;
use crate::model::{AssignmentId, BillingMonth, FeeId, Money, ParkId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Routing key for [`EventType::AssignmentCreated`].
pub const PARKING_ASSIGNED_KEY: &str = "parking.assigned";

/// Routing key for [`EventType::FeePaid`].
pub const FEE_PAID_KEY: &str = "fee.paid";

/// Errors from encoding or decoding events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Body is not a valid event of the expected type
    #[error("Malformed event body: {0}")]
    Malformed(String),

    /// Routing key does not name a known event type
    #[error("Unknown event type for routing key '{0}'")]
    UnknownType(String),

    /// Encoding failed
    #[error("Failed to serialize event: {0}")]
    Serialization(String),
}

/// Kinds of domain event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A parking space was assigned to an owner
    AssignmentCreated,
    /// A monthly fee was paid
    FeePaid,
}

impl EventType {
    /// Routing key the event is published under.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::AssignmentCreated => PARKING_ASSIGNED_KEY,
            Self::FeePaid => FEE_PAID_KEY,
        }
    }

    /// Stable name, used in headers, metrics labels and the outbox.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AssignmentCreated => "AssignmentCreated",
            Self::FeePaid => "FeePaid",
        }
    }

    /// Resolve the event type from a routing key.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownType`] for keys no event is published under.
    pub fn from_routing_key(key: &str) -> Result<Self, EventError> {
        match key {
            PARKING_ASSIGNED_KEY => Ok(Self::AssignmentCreated),
            FEE_PAID_KEY => Ok(Self::FeePaid),
            other => Err(EventError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parking space was assigned to an owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentCreated {
    /// Assignment row in parking-service
    pub owner_parking_id: AssignmentId,
    /// Owner receiving the space
    pub user_id: UserId,
    /// Space assigned
    pub park_id: ParkId,
    /// Registered car plate
    pub car_number: String,
    /// Start of the assignment; determines the first billing month
    pub entry_time: DateTime<Utc>,
}

/// A monthly fee was paid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeePaid {
    /// Fee settled
    pub fee_id: FeeId,
    /// Owner who paid
    pub user_id: UserId,
    /// Space the fee covered
    pub park_id: ParkId,
    /// Month the fee covered, `YYYY-MM`
    pub payment_month: BillingMonth,
    /// Amount paid
    pub payment_amount: Money,
    /// When payment was committed
    pub payment_time: DateTime<Utc>,
}

/// Typed event payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventPayload {
    /// See [`AssignmentCreated`]
    AssignmentCreated(AssignmentCreated),
    /// See [`FeePaid`]
    FeePaid(FeePaid),
}

impl EventPayload {
    /// The payload's event type.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::AssignmentCreated(_) => EventType::AssignmentCreated,
            Self::FeePaid(_) => EventType::FeePaid,
        }
    }
}

impl From<AssignmentCreated> for EventPayload {
    fn from(value: AssignmentCreated) -> Self {
        Self::AssignmentCreated(value)
    }
}

impl From<FeePaid> for EventPayload {
    fn from(value: FeePaid) -> Self {
        Self::FeePaid(value)
    }
}

/// An event that has not been stamped yet.
///
/// `event_id` and `emitted_at` may be pre-set by a caller that is retrying a
/// logical event it already stamped; otherwise they are assigned by
/// [`EventDraft::stamp`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDraft {
    /// Payload
    pub payload: EventPayload,
    /// Correlation id of the request that caused the event
    pub correlation_id: Option<String>,
    /// Pre-assigned identifier
    pub event_id: Option<Uuid>,
    /// Pre-assigned emission time
    pub emitted_at: Option<DateTime<Utc>>,
}

impl EventDraft {
    /// Draft with nothing pre-assigned.
    #[must_use]
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self {
            payload: payload.into(),
            correlation_id: None,
            event_id: None,
            emitted_at: None,
        }
    }

    /// Attach the correlation id of the originating request.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Reuse an identifier assigned by an earlier attempt.
    #[must_use]
    pub const fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = Some(event_id);
        self
    }

    /// Assign any missing identifier and timestamp.
    ///
    /// Values already present are kept, so stamping is idempotent.
    #[must_use]
    pub fn stamp(self, clock: &dyn Clock) -> DomainEvent {
        DomainEvent {
            event_id: self.event_id.unwrap_or_else(Uuid::new_v4),
            correlation_id: self.correlation_id,
            emitted_at: self.emitted_at.unwrap_or_else(|| clock.now()),
            payload: self.payload,
        }
    }
}

/// A stamped domain event.
///
/// `event_id` is the idempotency key and never changes across redelivery
/// or republishing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainEvent {
    /// Idempotency key
    pub event_id: Uuid,
    /// Correlation id of the originating request
    pub correlation_id: Option<String>,
    /// When the event was stamped
    pub emitted_at: DateTime<Utc>,
    /// Payload
    pub payload: EventPayload,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEvent<P> {
    event_id: Uuid,
    #[serde(flatten)]
    payload: P,
    event_time: DateTime<Utc>,
}

impl DomainEvent {
    /// The event's type.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Routing key the event is published under.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        self.event_type().routing_key()
    }

    /// The payload if this is an `AssignmentCreated` event.
    #[must_use]
    pub const fn as_assignment_created(&self) -> Option<&AssignmentCreated> {
        match &self.payload {
            EventPayload::AssignmentCreated(payload) => Some(payload),
            EventPayload::FeePaid(_) => None,
        }
    }

    /// The payload if this is a `FeePaid` event.
    #[must_use]
    pub const fn as_fee_paid(&self) -> Option<&FeePaid> {
        match &self.payload {
            EventPayload::FeePaid(payload) => Some(payload),
            EventPayload::AssignmentCreated(_) => None,
        }
    }

    /// Encode the message body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if JSON encoding fails.
    pub fn to_body(&self) -> Result<Vec<u8>, EventError> {
        let encoded = match &self.payload {
            EventPayload::AssignmentCreated(payload) => serde_json::to_vec(&WireEvent {
                event_id: self.event_id,
                payload,
                event_time: self.emitted_at,
            }),
            EventPayload::FeePaid(payload) => serde_json::to_vec(&WireEvent {
                event_id: self.event_id,
                payload,
                event_time: self.emitted_at,
            }),
        };
        encoded.map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode a message body of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] if the body is not valid JSON for the
    /// event type, or lacks `eventId`/`eventTime`.
    pub fn from_body(
        event_type: EventType,
        body: &[u8],
        correlation_id: Option<String>,
    ) -> Result<Self, EventError> {
        fn decode<P: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<WireEvent<P>, EventError> {
            serde_json::from_slice(body).map_err(|e| EventError::Malformed(e.to_string()))
        }

        let (event_id, emitted_at, payload) = match event_type {
            EventType::AssignmentCreated => {
                let wire = decode::<AssignmentCreated>(body)?;
                (wire.event_id, wire.event_time, EventPayload::AssignmentCreated(wire.payload))
            }
            EventType::FeePaid => {
                let wire = decode::<FeePaid>(body)?;
                (wire.event_id, wire.event_time, EventPayload::FeePaid(wire.payload))
            }
        };

        Ok(Self {
            event_id,
            correlation_id,
            emitted_at,
            payload,
        })
    }
}
