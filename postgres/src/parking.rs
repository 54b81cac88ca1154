//! parking-service datastore: owner assignments.
//!
//! The partial unique indexes `owner_parking_active_user` and
//! `owner_parking_active_space` enforce one active assignment per owner and
//! per space; a losing concurrent insert is mapped back to the matching
//! [`AssignError`] variant.

use crate::error::{corrupt, map_sqlx, violated_constraint};
use crate::outbox::{PgOutbox, record_event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parkflow_core::event::DomainEvent;
use parkflow_core::model::{AssignmentId, AssignmentStatus, NewAssignment, ParkId, ParkingAssignment, UserId};
use parkflow_core::store::{AssignError, AssignmentEventFactory, AssignmentRepository, StoreError};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, user_id, park_id, park_num, car_number, entry_time, exit_time, status";

const ACTIVE_USER_INDEX: &str = "owner_parking_active_user";
const ACTIVE_SPACE_INDEX: &str = "owner_parking_active_space";

/// `PostgreSQL`-backed [`AssignmentRepository`].
#[derive(Clone, Debug)]
pub struct PgAssignmentStore {
    pool: PgPool,
}

impl PgAssignmentStore {
    /// Store over the parking-service pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Outbox sharing this store's pool.
    #[must_use]
    pub fn outbox(&self) -> PgOutbox {
        PgOutbox::new(self.pool.clone())
    }

    /// Readiness probe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(map_sqlx)?;
        Ok(())
    }

    fn row_to_assignment(row: &PgRow) -> Result<ParkingAssignment, StoreError> {
        let status: String = row.try_get("status").map_err(map_sqlx)?;

        Ok(ParkingAssignment {
            assignment_id: AssignmentId::new(row.try_get("assignment_id").map_err(map_sqlx)?),
            user_id: UserId::new(row.try_get("user_id").map_err(map_sqlx)?),
            park_id: ParkId::new(row.try_get("park_id").map_err(map_sqlx)?),
            park_num: row.try_get("park_num").map_err(map_sqlx)?,
            car_number: row.try_get("car_number").map_err(map_sqlx)?,
            entry_time: row.try_get("entry_time").map_err(map_sqlx)?,
            exit_time: row.try_get("exit_time").map_err(map_sqlx)?,
            status: AssignmentStatus::parse(&status).map_err(|e| corrupt("status", e))?,
        })
    }

    async fn active_by(&self, column: &str, id: i64) -> Result<Option<ParkingAssignment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM owner_parking WHERE {column} = $1 AND status = 'active'"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(Self::row_to_assignment).transpose()
    }

    async fn release_by(
        &self,
        column: &str,
        id: i64,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError> {
        let row = sqlx::query(&format!(
            r"
            UPDATE owner_parking
            SET status = 'closed', exit_time = $2
            WHERE {column} = $1 AND status = 'active'
            RETURNING {ASSIGNMENT_COLUMNS}
            "
        ))
        .bind(id)
        .bind(exit_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(Self::row_to_assignment).transpose()
    }
}

#[async_trait]
impl AssignmentRepository for PgAssignmentStore {
    async fn active_for_user(&self, user_id: UserId) -> Result<Option<ParkingAssignment>, StoreError> {
        self.active_by("user_id", user_id.get()).await
    }

    async fn active_for_space(&self, park_id: ParkId) -> Result<Option<ParkingAssignment>, StoreError> {
        self.active_by("park_id", park_id.get()).await
    }

    async fn assign(
        &self,
        assignment: NewAssignment,
        event: &AssignmentEventFactory<'_>,
    ) -> Result<(ParkingAssignment, DomainEvent), AssignError> {
        if self.active_for_user(assignment.user_id).await?.is_some() {
            return Err(AssignError::UserAlreadyAssigned(assignment.user_id));
        }
        if self.active_for_space(assignment.park_id).await?.is_some() {
            return Err(AssignError::SpaceOccupied(assignment.park_id));
        }

        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let inserted = sqlx::query(&format!(
            r"
            INSERT INTO owner_parking (user_id, park_id, park_num, car_number, entry_time, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            RETURNING {ASSIGNMENT_COLUMNS}
            "
        ))
        .bind(assignment.user_id.get())
        .bind(assignment.park_id.get())
        .bind(assignment.park_num.as_deref())
        .bind(&assignment.car_number)
        .bind(assignment.entry_time)
        .fetch_one(&mut *tx)
        .await;

        // The pre-checks above race with concurrent assigns; the indexes decide.
        let row = match inserted {
            Ok(row) => row,
            Err(e) => {
                return Err(match violated_constraint(&e).as_deref() {
                    Some(ACTIVE_USER_INDEX) => AssignError::UserAlreadyAssigned(assignment.user_id),
                    Some(ACTIVE_SPACE_INDEX) => AssignError::SpaceOccupied(assignment.park_id),
                    _ => AssignError::Store(map_sqlx(e)),
                });
            }
        };

        let created = Self::row_to_assignment(&row)?;
        let stamped = event(&created);
        record_event(&mut tx, &stamped).await?;
        tx.commit().await.map_err(map_sqlx)?;

        tracing::info!(
            assignment_id = %created.assignment_id,
            user_id = %created.user_id,
            park_id = %created.park_id,
            event_id = %stamped.event_id,
            "Parking space assigned"
        );
        Ok((created, stamped))
    }

    async fn release_for_user(
        &self,
        user_id: UserId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError> {
        self.release_by("user_id", user_id.get(), exit_time).await
    }

    async fn release_for_space(
        &self,
        park_id: ParkId,
        exit_time: DateTime<Utc>,
    ) -> Result<Option<ParkingAssignment>, StoreError> {
        self.release_by("park_id", park_id.get(), exit_time).await
    }
}
