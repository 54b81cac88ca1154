//! Assigning and returning parking spaces.

use parkflow_core::environment::Clock;
use parkflow_core::event::{AssignmentCreated, DomainEvent, EventDraft};
use parkflow_core::model::{ActiveParkingRecord, NewAssignment, ParkId, ParkingAssignment, UserId};
use parkflow_core::store::{AssignError, AssignmentRepository, Outbox, StoreError};
use parkflow_runtime::client::DegradedReason;
use parkflow_runtime::directory::UserDirectoryClient;
use parkflow_runtime::publisher::EventPublisher;
use std::sync::Arc;
use thiserror::Error;

/// Why an assignment request was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    /// Malformed input
    #[error("{0}")]
    InvalidRequest(String),

    /// user-service does not know the owner
    #[error("Owner {0} not found")]
    OwnerNotFound(UserId),

    /// user-service could not be asked
    #[error("User service unavailable: {0}")]
    DependencyUnavailable(String),

    /// The owner already holds a space
    #[error("User {0} already holds an active parking space")]
    UserAlreadyAssigned(UserId),

    /// The space is already held
    #[error("Parking space {0} is already assigned")]
    SpaceOccupied(ParkId),

    /// Nothing active to return or report
    #[error("No active parking assignment")]
    NoActiveAssignment,

    /// Datastore failure
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<AssignError> for AssignmentError {
    fn from(err: AssignError) -> Self {
        match err {
            AssignError::UserAlreadyAssigned(user) => Self::UserAlreadyAssigned(user),
            AssignError::SpaceOccupied(park) => Self::SpaceOccupied(park),
            AssignError::Store(e) => Self::Storage(e),
        }
    }
}

/// A request to assign `park_id` to `user_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignRequest {
    /// Owner receiving the space
    pub user_id: UserId,
    /// Space to assign
    pub park_id: ParkId,
    /// Human-readable space number
    pub park_num: Option<String>,
    /// Registered car plate
    pub car_number: String,
}

/// Which active assignment to close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnTarget {
    /// The owner's
    User(UserId),
    /// The space's
    Space(ParkId),
}

/// Assignment workflow.
#[derive(Clone)]
pub struct AssignmentService {
    store: Arc<dyn AssignmentRepository>,
    outbox: Arc<dyn Outbox>,
    users: UserDirectoryClient,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
}

impl AssignmentService {
    /// Service over its collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn AssignmentRepository>,
        outbox: Arc<dyn Outbox>,
        users: UserDirectoryClient,
        publisher: EventPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            outbox,
            users,
            publisher,
            clock,
        }
    }

    /// The user-service client (its breaker feeds readiness).
    #[must_use]
    pub const fn users(&self) -> &UserDirectoryClient {
        &self.users
    }

    /// Assign a space and publish `AssignmentCreated`.
    ///
    /// The assignment and its outbox row commit together. A failed publish
    /// afterwards is logged and left to the reconciliation sweep.
    ///
    /// # Errors
    ///
    /// See [`AssignmentError`]. An unreachable user-service refuses the
    /// assignment rather than assuming the owner exists.
    pub async fn assign(
        &self,
        request: AssignRequest,
        correlation_id: Option<&str>,
    ) -> Result<ParkingAssignment, AssignmentError> {
        let car_number = request.car_number.trim();
        if car_number.is_empty() {
            return Err(AssignmentError::InvalidRequest("carNumber is required".into()));
        }

        match self.users.owner(request.user_id, correlation_id).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(DegradedReason::BusinessRejected(_)) => {
                return Err(AssignmentError::OwnerNotFound(request.user_id));
            }
            Err(DegradedReason::Unavailable(reason)) => {
                return Err(AssignmentError::DependencyUnavailable(reason));
            }
        }

        let assignment = NewAssignment {
            user_id: request.user_id,
            park_id: request.park_id,
            park_num: request.park_num,
            car_number: car_number.to_string(),
            entry_time: self.clock.now(),
        };

        let stamp = |created: &ParkingAssignment| -> DomainEvent {
            let draft = EventDraft::new(AssignmentCreated {
                owner_parking_id: created.assignment_id,
                user_id: created.user_id,
                park_id: created.park_id,
                car_number: created.car_number.clone(),
                entry_time: created.entry_time,
            });
            let draft = match correlation_id {
                Some(id) => draft.with_correlation_id(id),
                None => draft,
            };
            self.publisher.stamp(draft)
        };

        let (created, event) = self.store.assign(assignment, &stamp).await?;

        if let Err(e) = self.publisher.send(&event).await {
            tracing::warn!(
                event_id = %event.event_id,
                assignment_id = %created.assignment_id,
                error = %e,
                "AssignmentCreated not published; left for reconciliation"
            );
            if let Err(e) = self.outbox.mark_failed(event.event_id, &e.to_string()).await {
                tracing::warn!(event_id = %event.event_id, error = %e, "Failed to mark outbox row failed");
            }
        }

        Ok(created)
    }

    /// Close an active assignment now.
    ///
    /// # Errors
    ///
    /// [`AssignmentError::NoActiveAssignment`] when nothing is active.
    pub async fn return_space(&self, target: ReturnTarget) -> Result<ParkingAssignment, AssignmentError> {
        let now = self.clock.now();
        let released = match target {
            ReturnTarget::User(user_id) => self.store.release_for_user(user_id, now).await?,
            ReturnTarget::Space(park_id) => self.store.release_for_space(park_id, now).await?,
        };

        let released = released.ok_or(AssignmentError::NoActiveAssignment)?;
        tracing::info!(
            assignment_id = %released.assignment_id,
            user_id = %released.user_id,
            park_id = %released.park_id,
            "Parking space returned"
        );
        Ok(released)
    }

    /// The owner's active assignment as served to other services.
    ///
    /// # Errors
    ///
    /// [`AssignmentError::NoActiveAssignment`] when the owner holds no space.
    pub async fn active_record(&self, user_id: UserId) -> Result<ActiveParkingRecord, AssignmentError> {
        self.store
            .active_for_user(user_id)
            .await?
            .map(|assignment| assignment.to_record())
            .ok_or(AssignmentError::NoActiveAssignment)
    }
}
