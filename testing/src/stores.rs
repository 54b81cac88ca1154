//! In-memory storage adapters.
//!
//! Each store keeps its state behind one mutex, so the "transactions" the
//! storage traits require (ledger row + side effect, guarded settle + outbox
//! row, assignment + outbox row) are trivially atomic.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Poisoned locks only occur after a test already panicked

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parkflow_core::event::DomainEvent;
use parkflow_core::model::{
    AssignmentId, AssignmentStatus, FeeId, FeeNotification, FeeRecord, FeeStatus, NewAssignment,
    NewFeeRecord, OwnerProfile, ParkId, ParkingAssignment, ProcessingLedgerEntry, UserId,
};
use parkflow_core::store::{
    ApplyOutcome, AssignError, AssignmentEventFactory, AssignmentRepository, FeeRepository,
    IdempotencyLedger, OwnerDirectory, Outbox, OutboxEntry, OutboxStatus, SettleOutcome, SideEffect,
    StoreError,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Shared failure switch: the next `n` operations fail with [`StoreError::Unavailable`].
#[derive(Clone, Debug, Default)]
struct Outage(Arc<Mutex<usize>>);

impl Outage {
    fn set(&self, count: usize) {
        *self.0.lock().unwrap() = count;
    }

    fn check(&self) -> Result<(), StoreError> {
        let mut remaining = self.0.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Outbox
// ============================================================================

/// In-memory [`Outbox`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    entries: Arc<Mutex<Vec<OutboxEntry>>>,
}

impl InMemoryOutbox {
    /// Empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly committed event as pending.
    pub fn record(&self, event: DomainEvent) {
        let created_at = event.emitted_at;
        self.entries.lock().unwrap().push(OutboxEntry {
            event,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at,
        });
    }

    /// Snapshot of every row, in insertion order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Status of the row for `event_id`.
    #[must_use]
    pub fn status(&self, event_id: Uuid) -> Option<OutboxStatus> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.event.event_id == event_id)
            .map(|e| e.status)
    }

    fn update(&self, event_id: Uuid, apply: impl FnOnce(&mut OutboxEntry)) {
        if let Some(entry) = self
            .entries
            .lock()
            .unwrap()
            .iter_mut()
            .find(|e| e.event.event_id == event_id)
        {
            apply(entry);
        }
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn mark_confirmed(&self, event_id: Uuid) -> Result<(), StoreError> {
        self.update(event_id, |entry| {
            entry.status = OutboxStatus::Confirmed;
            entry.last_error = None;
        });
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.update(event_id, |entry| {
            if entry.status != OutboxStatus::Confirmed {
                entry.status = OutboxStatus::Failed;
                entry.last_error = Some(reason.to_string());
            }
        });
        Ok(())
    }

    async fn due_for_replay(
        &self,
        pending_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut due: Vec<OutboxEntry> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.attempts < max_attempts)
            .filter(|e| match e.status {
                OutboxStatus::Failed => true,
                OutboxStatus::Pending => e.created_at < pending_before,
                OutboxStatus::Confirmed => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|e| e.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn record_attempt(&self, event_id: Uuid) -> Result<(), StoreError> {
        self.update(event_id, |entry| {
            entry.attempts += 1;
            entry.status = OutboxStatus::Pending;
        });
        Ok(())
    }
}

// ============================================================================
// Fee store
// ============================================================================

#[derive(Debug, Default)]
struct FeeState {
    ledger: HashSet<(Uuid, String)>,
    ledger_entries: Vec<ProcessingLedgerEntry>,
    fees: BTreeMap<FeeId, FeeRecord>,
    next_fee_id: i64,
    notifications: Vec<FeeNotification>,
}

/// In-memory fee-service datastore: ledger, fees, notifications and outbox.
#[derive(Clone, Debug, Default)]
pub struct InMemoryFeeStore {
    state: Arc<Mutex<FeeState>>,
    outbox: InMemoryOutbox,
    outage: Outage,
}

impl InMemoryFeeStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store's outbox.
    #[must_use]
    pub const fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }

    /// Make the next `count` operations fail as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.outage.set(count);
    }

    /// Insert an unpaid fee directly.
    pub fn insert_fee(&self, fee: NewFeeRecord, created_at: DateTime<Utc>) -> FeeRecord {
        let mut state = self.state.lock().unwrap();
        insert_fee(&mut state, fee, created_at)
    }

    /// Every fee, by id.
    #[must_use]
    pub fn fees(&self) -> Vec<FeeRecord> {
        self.state.lock().unwrap().fees.values().cloned().collect()
    }

    /// Every ledger row, in insertion order.
    #[must_use]
    pub fn ledger(&self) -> Vec<ProcessingLedgerEntry> {
        self.state.lock().unwrap().ledger_entries.clone()
    }

    /// Every recorded notification, in insertion order.
    #[must_use]
    pub fn notifications(&self) -> Vec<FeeNotification> {
        self.state.lock().unwrap().notifications.clone()
    }
}

fn insert_fee(state: &mut FeeState, fee: NewFeeRecord, created_at: DateTime<Utc>) -> FeeRecord {
    state.next_fee_id += 1;
    let record = FeeRecord {
        fee_id: FeeId::new(state.next_fee_id),
        user_id: fee.user_id,
        park_id: fee.park_id,
        billing_month: fee.billing_month,
        amount: fee.amount,
        status: FeeStatus::Unpaid,
        paid_at: None,
        created_at,
    };
    state.fees.insert(record.fee_id, record.clone());
    record
}

#[async_trait]
impl IdempotencyLedger for InMemoryFeeStore {
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, StoreError> {
        self.outage.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .contains(&(event_id, consumer.to_string())))
    }

    async fn apply_once(
        &self,
        entry: ProcessingLedgerEntry,
        effect: SideEffect,
    ) -> Result<ApplyOutcome, StoreError> {
        self.outage.check()?;
        let mut state = self.state.lock().unwrap();

        if !state.ledger.insert((entry.event_id, entry.consumer_name.clone())) {
            return Ok(ApplyOutcome::AlreadyProcessed);
        }

        let outcome = match effect {
            SideEffect::CreateFee(fee) => {
                let exists = state.fees.values().any(|f| {
                    f.user_id == fee.user_id && f.park_id == fee.park_id && f.billing_month == fee.billing_month
                });
                if exists {
                    ApplyOutcome::AlreadySatisfied
                } else {
                    insert_fee(&mut state, fee, entry.processed_at);
                    ApplyOutcome::Applied
                }
            }
            SideEffect::RecordNotification(notification) => {
                state.notifications.push(notification);
                ApplyOutcome::Applied
            }
        };

        state.ledger_entries.push(entry);
        Ok(outcome)
    }
}

#[async_trait]
impl FeeRepository for InMemoryFeeStore {
    async fn find_fee(&self, fee_id: FeeId) -> Result<Option<FeeRecord>, StoreError> {
        self.outage.check()?;
        Ok(self.state.lock().unwrap().fees.get(&fee_id).cloned())
    }

    async fn fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError> {
        self.outage.check()?;
        let mut fees: Vec<FeeRecord> = self
            .state
            .lock()
            .unwrap()
            .fees
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect();
        fees.sort_by(|a, b| b.billing_month.cmp(&a.billing_month).then(b.fee_id.cmp(&a.fee_id)));
        Ok(fees)
    }

    async fn unpaid_fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError> {
        self.outage.check()?;
        let mut fees: Vec<FeeRecord> = self
            .state
            .lock()
            .unwrap()
            .fees
            .values()
            .filter(|f| f.user_id == user_id && !f.is_paid())
            .cloned()
            .collect();
        fees.sort_by(|a, b| a.billing_month.cmp(&b.billing_month).then(a.fee_id.cmp(&b.fee_id)));
        Ok(fees)
    }

    async fn settle_fee(
        &self,
        fee_id: FeeId,
        paid_at: DateTime<Utc>,
        event: &DomainEvent,
    ) -> Result<SettleOutcome, StoreError> {
        self.outage.check()?;
        let mut state = self.state.lock().unwrap();

        let Some(fee) = state.fees.get_mut(&fee_id).filter(|f| !f.is_paid()) else {
            return Ok(SettleOutcome::AlreadyPaid);
        };
        fee.status = FeeStatus::Paid;
        fee.paid_at = Some(paid_at);
        let settled = fee.clone();

        // Outbox row is written while the fee lock is held.
        self.outbox.record(event.clone());
        Ok(SettleOutcome::Settled(settled))
    }

    async fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<FeeNotification>, StoreError> {
        self.outage.check()?;
        let mut notices: Vec<FeeNotification> = self
            .state
            .lock()
            .unwrap()
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        notices.reverse();
        Ok(notices)
    }
}

// ============================================================================
// Assignment store
// ============================================================================

#[derive(Debug, Default)]
struct AssignmentState {
    assignments: Vec<ParkingAssignment>,
    next_id: i64,
}

/// In-memory parking-service datastore: assignments and outbox.
#[derive(Clone, Debug, Default)]
pub struct InMemoryAssignmentStore {
    state: Arc<Mutex<AssignmentState>>,
    outbox: InMemoryOutbox,
    outage: Outage,
}

impl InMemoryAssignmentStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store's outbox.
    #[must_use]
    pub const fn outbox(&self) -> &InMemoryOutbox {
        &self.outbox
    }

    /// Make the next `count` operations fail as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.outage.set(count);
    }

    /// Every assignment, active and closed.
    #[must_use]
    pub fn assignments(&self) -> Vec<ParkingAssignment> {
        self.state.lock().unwrap().assignments.clone()
    }

    fn release(
        &self,
        exit_time: DateTime<Utc>,
        matches: impl Fn(&ParkingAssignment) -> bool,
    ) -> Option<ParkingAssignment> {
        let mut state = self.state.lock().unwrap();
        let assignment = state
            .assignments
            .iter_mut()
            .find(|a| a.status == AssignmentStatus::Active && matches(a))?;
        assignment.status = AssignmentStatus::Closed;
        assignment.exit_time = Some(exit_time);
        Some(assignment.clone())
    }
}

#[async_trait]
impl AssignmentRepository for InMemoryAssignmentStore {
    async fn active_for_user(&self, user_id: UserId) -> Result<Option<ParkingAssignment>, StoreError> {
        self.outage.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .iter()
            .find(|a| a.status == AssignmentStatus::Active && a.user_id == user_id)
            .cloned())
    }

    async fn active_for_space(&self, park_id: ParkId) -> Result<Option<ParkingAssignment>, StoreError> {
        self.outage.check()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .assignments
            .iter()
            .find(|a| a.status == AssignmentStatus::Active && a.park_id == park_id)
            .cloned())
    }

    async fn assign(
        &self,
        assignment: NewAssignment,
        event: &AssignmentEventFactory<'_>,
    ) -> Result<(ParkingAssignment, DomainEvent), AssignError> {
        self.outage.check()?;
        let mut state = self.state.lock().unwrap();

        let active = |a: &&ParkingAssignment| a.status == AssignmentStatus::Active;
        if state.assignments.iter().filter(active).any(|a| a.user_id == assignment.user_id) {
            return Err(AssignError::UserAlreadyAssigned(assignment.user_id));
        }
        if state.assignments.iter().filter(active).any(|a| a.park_id == assignment.park_id) {
            return Err(AssignError::SpaceOccupied(assignment.park_id));
        }

        state.next_id += 1;
        let created = ParkingAssignment {
            assignment_id: AssignmentId::new(state.next_id),
            user_id: assignment.user_id,
            park_id: assignment.park_id,
            park_num: assignment.park_num,
            car_number: assignment.car_number,
            entry_time: assignment.entry_time,
            exit_time: None,
            status: AssignmentStatus::Active,
        };
        let stamped = event(&created);
        state.assignments.push(created.clone());
        self.outbox.record(stamped.clone());

        Ok((created, stamped))
    }

    async fn release_for_user(
        &self,
        user_id: UserId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError> {
        self.outage.check()?;
        Ok(self.release(exit_time, |a| a.user_id == user_id))
    }

    async fn release_for_space(
        &self,
        park_id: ParkId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError> {
        self.outage.check()?;
        Ok(self.release(exit_time, |a| a.park_id == park_id))
    }
}

// ============================================================================
// Owner directory
// ============================================================================

/// In-memory [`OwnerDirectory`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryOwnerDirectory {
    owners: Arc<Mutex<HashMap<UserId, OwnerProfile>>>,
    outage: Outage,
}

impl InMemoryOwnerDirectory {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an owner.
    #[must_use]
    pub fn with_owner(self, owner: OwnerProfile) -> Self {
        self.owners.lock().unwrap().insert(owner.user_id, owner);
        self
    }

    /// Make the next `count` lookups fail as unavailable.
    pub fn fail_next(&self, count: usize) {
        self.outage.set(count);
    }
}

#[async_trait]
impl OwnerDirectory for InMemoryOwnerDirectory {
    async fn find_owner(&self, user_id: UserId) -> Result<Option<OwnerProfile>, StoreError> {
        self.outage.check()?;
        Ok(self.owners.lock().unwrap().get(&user_id).cloned())
    }
}
