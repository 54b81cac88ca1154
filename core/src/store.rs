//! Storage traits for the services.
//!
//! Each service owns its own tables; these traits are the seams between the
//! workflow logic in `parkflow-runtime` and the services, and the storage
//! adapters (`parkflow-postgres` for production, in-memory stores in
//! `parkflow-testing`).
//!
//! # Atomicity requirements
//!
//! - [`IdempotencyLedger::apply_once`] writes the ledger row and the side
//!   effect together. A concurrent duplicate for the same
//!   `(eventId, consumerName)` must be rejected by storage (unique key or a
//!   single writer), never by a read-then-write in application code.
//! - [`FeeRepository::settle_fee`] flips `unpaid → paid` only if the fee is
//!   still unpaid, and records the `FeePaid` event in the outbox in the same
//!   transaction.
//! - [`AssignmentRepository::assign`] inserts the assignment and its
//!   `AssignmentCreated` outbox row in the same transaction.

use crate::event::DomainEvent;
use crate::model::{
    FeeId, FeeNotification, FeeRecord, NewAssignment, NewFeeRecord,
    OwnerProfile, ParkId, ParkingAssignment, ProcessingLedgerEntry, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors from storage adapters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Datastore briefly unavailable (pool exhausted, connection reset)
    #[error("Datastore unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness rule was violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored data could not be mapped to the domain model
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// Any other database failure
    #[error("Database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether the same operation may succeed if retried later.
    ///
    /// Consumers requeue transient failures and dead-letter the rest; the
    /// HTTP layer reports them as 503 rather than 500.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

// ============================================================================
// Idempotent consumption
// ============================================================================

/// Business write applied by a consumer together with its ledger row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SideEffect {
    /// Issue a monthly fee (assignment consumer)
    CreateFee(NewFeeRecord),
    /// Record a payment notice (notification consumer)
    RecordNotification(FeeNotification),
}

/// Result of [`IdempotencyLedger::apply_once`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Ledger row and side effect were written
    Applied,
    /// A ledger row for this `(eventId, consumerName)` already existed; nothing written
    AlreadyProcessed,
    /// The ledger row was written but the business state already satisfied the
    /// effect (a fee for the same user, space and month exists)
    AlreadySatisfied,
}

/// Processing ledger shared by a service's consumers.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Whether `consumer` has already applied `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the ledger cannot be read.
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, StoreError>;

    /// Atomically insert the ledger row and apply `effect`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails; nothing is written in that case.
    async fn apply_once(
        &self,
        entry: ProcessingLedgerEntry,
        effect: SideEffect,
    ) -> Result<ApplyOutcome, StoreError>;
}

// ============================================================================
// Fees
// ============================================================================

/// Result of [`FeeRepository::settle_fee`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The fee moved from unpaid to paid
    Settled(FeeRecord),
    /// The fee was already paid (or missing); nothing changed
    AlreadyPaid,
}

/// Fee records owned by fee-service.
#[async_trait]
pub trait FeeRepository: Send + Sync {
    /// Load a fee by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn find_fee(&self, fee_id: FeeId) -> Result<Option<FeeRecord>, StoreError>;

    /// All fees for an owner, newest month first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError>;

    /// Unpaid fees for an owner, oldest month first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn unpaid_fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError>;

    /// Mark the fee paid at `paid_at` if it is still unpaid, and record
    /// `event` in the outbox in the same transaction.
    ///
    /// Zero rows updated (another attempt won the race) yields
    /// [`SettleOutcome::AlreadyPaid`] and writes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure; nothing is written in that case.
    async fn settle_fee(
        &self,
        fee_id: FeeId,
        paid_at: DateTime<Utc>,
        event: &DomainEvent,
    ) -> Result<SettleOutcome, StoreError>;

    /// Notices recorded for an owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<FeeNotification>, StoreError>;
}

// ============================================================================
// Assignments and owners
// ============================================================================

/// Builds the stamped `AssignmentCreated` event for a freshly inserted assignment.
pub type AssignmentEventFactory<'a> = dyn Fn(&ParkingAssignment) -> DomainEvent + Send + Sync + 'a;

/// Why an assignment could not be created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignError {
    /// The owner already holds an active assignment
    #[error("User {0} already holds an active parking space")]
    UserAlreadyAssigned(UserId),

    /// The space is already held
    #[error("Parking space {0} is already assigned")]
    SpaceOccupied(ParkId),

    /// Storage failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parking assignments owned by parking-service.
#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// The owner's active assignment, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn active_for_user(&self, user_id: UserId) -> Result<Option<ParkingAssignment>, StoreError>;

    /// The space's active assignment, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn active_for_space(&self, park_id: ParkId) -> Result<Option<ParkingAssignment>, StoreError>;

    /// Insert an active assignment and its outbox event in one transaction.
    ///
    /// The event is built from the inserted row so it carries the new id.
    ///
    /// # Errors
    ///
    /// Returns [`AssignError::UserAlreadyAssigned`] or
    /// [`AssignError::SpaceOccupied`] when an active assignment exists.
    async fn assign(
        &self,
        assignment: NewAssignment,
        event: &AssignmentEventFactory<'_>,
    ) -> Result<(ParkingAssignment, DomainEvent), AssignError>;

    /// Close the owner's active assignment at `exit_time`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn release_for_user(
        &self,
        user_id: UserId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError>;

    /// Close the space's active assignment at `exit_time`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn release_for_space(
        &self,
        park_id: ParkId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError>;
}

/// Owner profiles owned by user-service.
#[async_trait]
pub trait OwnerDirectory: Send + Sync {
    /// Look up an owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn find_owner(&self, user_id: UserId) -> Result<Option<OwnerProfile>, StoreError>;
}

// ============================================================================
// Outbox
// ============================================================================

/// Publication state of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Committed, not yet confirmed by the broker
    Pending,
    /// Broker confirmed the publish
    Confirmed,
    /// Broker nacked or returned the publish, or the send failed
    Failed,
}

impl OutboxStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "failed" => Ok(Self::Failed),
            _ => Err(StoreError::Corrupt(format!("Invalid outbox status: {s}"))),
        }
    }
}

/// An event recorded alongside the state change that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    /// The stamped event, identical on every republish
    pub event: DomainEvent,
    /// Publication state
    pub status: OutboxStatus,
    /// Publish attempts so far
    pub attempts: u32,
    /// Last failure reason
    pub last_error: Option<String>,
    /// When the row was written
    pub created_at: DateTime<Utc>,
}

/// Events awaiting broker confirmation.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Mark the event confirmed by the broker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn mark_confirmed(&self, event_id: Uuid) -> Result<(), StoreError>;

    /// Mark the event failed with a reason. Confirmed rows stay confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<(), StoreError>;

    /// Rows that are failed, or pending and created before `pending_before`,
    /// oldest first, excluding rows with `max_attempts` or more attempts.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn due_for_replay(
        &self,
        pending_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Count a replay attempt and reset the row to pending.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    async fn record_attempt(&self, event_id: Uuid) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(StoreError::Unavailable("pool timed out".into()).is_transient());
        assert!(!StoreError::Conflict("dup".into()).is_transient());
        assert!(!StoreError::Corrupt("bad".into()).is_transient());
        assert!(!StoreError::Database("syntax error".into()).is_transient());
    }

    #[test]
    fn outbox_status_literals() {
        for status in [OutboxStatus::Pending, OutboxStatus::Confirmed, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Ok(status));
        }
        assert!(OutboxStatus::parse("sent").is_err());
    }
}
