//! `PostgreSQL` outbox.
//!
//! Rows are written by the fee and assignment stores inside the transaction
//! that changes business state; [`PgOutbox`] then tracks their publication.

use crate::error::{corrupt, map_sqlx};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parkflow_core::event::{DomainEvent, EventType};
use parkflow_core::store::{Outbox, OutboxEntry, OutboxStatus, StoreError};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

/// Insert `event` as a pending outbox row on `conn` (normally a transaction).
pub(crate) async fn record_event(conn: &mut PgConnection, event: &DomainEvent) -> Result<(), StoreError> {
    let body = event.to_body().map_err(|e| StoreError::Database(e.to_string()))?;

    sqlx::query(
        r"
        INSERT INTO event_outbox (event_id, routing_key, correlation_id, body, status, created_at)
        VALUES ($1, $2, $3, $4, 'pending', $5)
        ON CONFLICT (event_id) DO NOTHING
        ",
    )
    .bind(event.event_id)
    .bind(event.routing_key())
    .bind(event.correlation_id.as_deref())
    .bind(body)
    .bind(event.emitted_at)
    .execute(conn)
    .await
    .map_err(map_sqlx)?;

    Ok(())
}

/// `PostgreSQL`-backed [`Outbox`].
#[derive(Clone, Debug)]
pub struct PgOutbox {
    pool: PgPool,
}

impl PgOutbox {
    /// Outbox over the service's pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &PgRow) -> Result<OutboxEntry, StoreError> {
        let routing_key: String = row.try_get("routing_key").map_err(map_sqlx)?;
        let body: Vec<u8> = row.try_get("body").map_err(map_sqlx)?;
        let correlation_id: Option<String> = row.try_get("correlation_id").map_err(map_sqlx)?;
        let status: String = row.try_get("status").map_err(map_sqlx)?;
        let attempts: i32 = row.try_get("attempts").map_err(map_sqlx)?;

        let event_type = EventType::from_routing_key(&routing_key).map_err(|e| corrupt("routing_key", e))?;
        let event = DomainEvent::from_body(event_type, &body, correlation_id).map_err(|e| corrupt("body", e))?;

        Ok(OutboxEntry {
            event,
            status: OutboxStatus::parse(&status)?,
            attempts: u32::try_from(attempts).map_err(|e| corrupt("attempts", e))?,
            last_error: row.try_get("last_error").map_err(map_sqlx)?,
            created_at: row.try_get("created_at").map_err(map_sqlx)?,
        })
    }
}

#[async_trait]
impl Outbox for PgOutbox {
    async fn mark_confirmed(&self, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE event_outbox SET status = 'confirmed', last_error = NULL WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE event_outbox
            SET status = 'failed', last_error = $2
            WHERE event_id = $1 AND status <> 'confirmed'
            ",
        )
        .bind(event_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        metrics::counter!("outbox_failures_total").increment(1);
        Ok(())
    }

    async fn due_for_replay(
        &self,
        pending_before: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        #[allow(clippy::cast_possible_wrap)] // Limit is reasonable size, i64 is safe
        let rows = sqlx::query(
            r"
            SELECT event_id, routing_key, correlation_id, body, status, attempts, last_error, created_at
            FROM event_outbox
            WHERE attempts < $2
              AND (status = 'failed' OR (status = 'pending' AND created_at < $1))
            ORDER BY created_at ASC
            LIMIT $3
            ",
        )
        .bind(pending_before)
        .bind(i64::from(max_attempts))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn record_attempt(&self, event_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE event_outbox SET attempts = attempts + 1, status = 'pending' WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }
}
