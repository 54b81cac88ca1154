//! # Parkflow Core
//!
//! Shared types for the Parkflow services: the parking-fee workflow that runs
//! space assignment → fee-record creation → fee payment → notification across
//! independently deployed services.
//!
//! This crate holds no I/O. It defines:
//!
//! - **Domain model**: owners, parking assignments, fee records, billing months, money
//! - **Domain events**: `AssignmentCreated` and `FeePaid`, their wire format and routing keys
//! - **Broker abstraction**: the [`broker::Broker`] trait with manual acknowledgement
//! - **Topology**: exchanges, queues, bindings and dead-letter routing, validated up front
//! - **Storage traits**: the idempotency ledger, fee and assignment repositories, the outbox
//! - **Envelope**: the uniform `{code, message, data}` response shape used between services
//!
//! ## Delivery model
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────┐  route   ┌───────────────────┐
//! │  Publisher   │──────────▶│ parking.exchange │────────▶│ per-consumer queue│
//! └──────────────┘            └──────────────────┘          └─────────┬─────────┘
//!                                                                     │ deliver
//!                                                                     ▼
//!                                                           ┌───────────────────┐
//!                                                           │ idempotent handler│
//!                                                           │ ledger + effect   │
//!                                                           └─────────┬─────────┘
//!                                                       ack / requeue │ / dead-letter
//!                                                                     ▼
//!                                                           ┌───────────────────┐
//!                                                           │ parking.dlx.queue │
//!                                                           └───────────────────┘
//! ```
//!
//! Delivery is at-least-once. Effects are applied at most once per
//! `(eventId, consumerName)` through the processing ledger.

pub mod broker;
pub mod envelope;
pub mod event;
pub mod model;
pub mod store;
pub mod topology;

pub use broker::{AckDecision, Broker, BrokerError, Delivery, OutboundMessage, PublishConfirm};
pub use envelope::ApiEnvelope;
pub use event::{DomainEvent, EventDraft, EventError, EventPayload, EventType};
pub use model::{BillingMonth, FeeId, Money, ParkId, UserId};

/// Environment traits injected into services.
///
/// All time-dependent code takes a [`Clock`](environment::Clock) so tests can
/// pin "now" to a fixed instant.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use parkflow_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time from the operating system.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
