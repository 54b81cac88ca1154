//! fee-service datastore: monthly fees, processing ledger, notifications.

use crate::error::{corrupt, map_sqlx};
use crate::outbox::{PgOutbox, record_event};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parkflow_core::event::DomainEvent;
use parkflow_core::model::{
    FeeId, FeeNotification, FeeRecord, FeeStatus, Money, NewFeeRecord, ParkId, ProcessingLedgerEntry,
    UserId,
};
use parkflow_core::store::{
    ApplyOutcome, FeeRepository, IdempotencyLedger, SettleOutcome, SideEffect, StoreError,
};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

const FEE_COLUMNS: &str = "fee_id, user_id, park_id, billing_month, amount_cents, status, paid_at, created_at";

/// `PostgreSQL`-backed fee-service store.
///
/// Implements both [`IdempotencyLedger`] and [`FeeRepository`]; ledger rows,
/// fee rows and outbox rows share one database so they can share a transaction.
///
/// # Example
///
/// ```no_run
/// use parkflow_postgres::PgFeeStore;
/// use parkflow_core::store::FeeRepository;
/// use parkflow_core::model::UserId;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let store = PgFeeStore::new(pool);
/// let unpaid = store.unpaid_fees_for_user(UserId::new(7)).await?;
/// println!("{} unpaid fees", unpaid.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PgFeeStore {
    pool: PgPool,
}

impl PgFeeStore {
    /// Store over the fee-service pool.
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

    fn row_to_fee(row: &PgRow) -> Result<FeeRecord, StoreError> {
        let month: String = row.try_get("billing_month").map_err(map_sqlx)?;
        let status: String = row.try_get("status").map_err(map_sqlx)?;

        Ok(FeeRecord {
            fee_id: FeeId::new(row.try_get("fee_id").map_err(map_sqlx)?),
            user_id: UserId::new(row.try_get("user_id").map_err(map_sqlx)?),
            park_id: ParkId::new(row.try_get("park_id").map_err(map_sqlx)?),
            billing_month: month.parse().map_err(|e| corrupt("billing_month", e))?,
            amount: Money::from_cents(row.try_get("amount_cents").map_err(map_sqlx)?),
            status: FeeStatus::parse(&status).map_err(|e| corrupt("status", e))?,
            paid_at: row.try_get("paid_at").map_err(map_sqlx)?,
            created_at: row.try_get("created_at").map_err(map_sqlx)?,
        })
    }

    async fn insert_fee(
        conn: &mut PgConnection,
        fee: &NewFeeRecord,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r"
            INSERT INTO monthly_fees (user_id, park_id, billing_month, amount_cents, status, created_at)
            VALUES ($1, $2, $3, $4, 'unpaid', $5)
            ON CONFLICT ON CONSTRAINT monthly_fees_owner_space_month DO NOTHING
            ",
        )
        .bind(fee.user_id.get())
        .bind(fee.park_id.get())
        .bind(fee.billing_month.to_string())
        .bind(fee.amount.cents())
        .bind(created_at)
        .execute(conn)
        .await
        .map_err(map_sqlx)?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn insert_notification(conn: &mut PgConnection, notice: &FeeNotification) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO fee_notifications (fee_id, user_id, message, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(notice.fee_id.get())
        .bind(notice.user_id.get())
        .bind(&notice.message)
        .bind(notice.created_at)
        .execute(conn)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Insert an unpaid fee outside the consumer path (seeding, back-office).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if a fee for the same owner, space and
    /// month exists.
    pub async fn insert_unpaid(&self, fee: &NewFeeRecord, created_at: DateTime<Utc>) -> Result<FeeRecord, StoreError> {
        let row = sqlx::query(&format!(
            r"
            INSERT INTO monthly_fees (user_id, park_id, billing_month, amount_cents, status, created_at)
            VALUES ($1, $2, $3, $4, 'unpaid', $5)
            RETURNING {FEE_COLUMNS}
            "
        ))
        .bind(fee.user_id.get())
        .bind(fee.park_id.get())
        .bind(fee.billing_month.to_string())
        .bind(fee.amount.cents())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Self::row_to_fee(&row)
    }
}

#[async_trait]
impl IdempotencyLedger for PgFeeStore {
    async fn is_processed(&self, event_id: Uuid, consumer: &str) -> Result<bool, StoreError> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM processing_ledger WHERE event_id = $1 AND consumer_name = $2)",
        )
        .bind(event_id)
        .bind(consumer)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(exists)
    }

    async fn apply_once(
        &self,
        entry: ProcessingLedgerEntry,
        effect: SideEffect,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // A concurrent duplicate blocks here until the first transaction
        // commits, then inserts nothing.
        let claimed = sqlx::query(
            r"
            INSERT INTO processing_ledger (event_id, consumer_name, processed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id, consumer_name) DO NOTHING
            ",
        )
        .bind(entry.event_id)
        .bind(&entry.consumer_name)
        .bind(entry.processed_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(ApplyOutcome::AlreadyProcessed);
        }

        let outcome = match &effect {
            SideEffect::CreateFee(fee) => {
                if Self::insert_fee(&mut tx, fee, entry.processed_at).await? {
                    ApplyOutcome::Applied
                } else {
                    ApplyOutcome::AlreadySatisfied
                }
            }
            SideEffect::RecordNotification(notice) => {
                Self::insert_notification(&mut tx, notice).await?;
                ApplyOutcome::Applied
            }
        };

        tx.commit().await.map_err(map_sqlx)?;

        tracing::debug!(
            event_id = %entry.event_id,
            consumer = %entry.consumer_name,
            ?outcome,
            "Ledger entry committed"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl FeeRepository for PgFeeStore {
    async fn find_fee(&self, fee_id: FeeId) -> Result<Option<FeeRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {FEE_COLUMNS} FROM monthly_fees WHERE fee_id = $1"))
            .bind(fee_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        row.as_ref().map(Self::row_to_fee).transpose()
    }

    async fn fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FEE_COLUMNS} FROM monthly_fees WHERE user_id = $1 ORDER BY billing_month DESC, fee_id DESC"
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::row_to_fee).collect()
    }

    async fn unpaid_fees_for_user(&self, user_id: UserId) -> Result<Vec<FeeRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FEE_COLUMNS} FROM monthly_fees WHERE user_id = $1 AND status = 'unpaid' \
             ORDER BY billing_month ASC, fee_id ASC"
        ))
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::row_to_fee).collect()
    }

    async fn settle_fee(
        &self,
        fee_id: FeeId,
        paid_at: DateTime<Utc>,
        event: &DomainEvent,
    ) -> Result<SettleOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let row = sqlx::query(&format!(
            r"
            UPDATE monthly_fees
            SET status = 'paid', paid_at = $2
            WHERE fee_id = $1 AND status = 'unpaid'
            RETURNING {FEE_COLUMNS}
            "
        ))
        .bind(fee_id.get())
        .bind(paid_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(map_sqlx)?;
            return Ok(SettleOutcome::AlreadyPaid);
        };
        let settled = Self::row_to_fee(&row)?;

        record_event(&mut tx, event).await?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(SettleOutcome::Settled(settled))
    }

    async fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<FeeNotification>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT fee_id, user_id, message, created_at
            FROM fee_notifications
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            ",
        )
        .bind(user_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(FeeNotification {
                    fee_id: FeeId::new(row.try_get("fee_id").map_err(map_sqlx)?),
                    user_id: UserId::new(row.try_get("user_id").map_err(map_sqlx)?),
                    message: row.try_get("message").map_err(map_sqlx)?,
                    created_at: row.try_get("created_at").map_err(map_sqlx)?,
                })
            })
            .collect()
    }
}
