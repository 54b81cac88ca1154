//! Table definitions.
//!
//! Each service owns its tables and runs only its own migration at startup.
//! Statements are idempotent (`IF NOT EXISTS`), so running them on every
//! boot is safe.

use crate::error::map_sqlx;
use parkflow_core::store::StoreError;
use sqlx::PgPool;

const OUTBOX: &str = r"
    CREATE TABLE IF NOT EXISTS event_outbox (
        event_id UUID PRIMARY KEY,
        routing_key TEXT NOT NULL,
        correlation_id TEXT,
        body BYTEA NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )
";

const OUTBOX_DUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_event_outbox_due ON event_outbox(created_at) WHERE status <> 'confirmed'";

/// fee-service: fees, processing ledger, notifications, outbox.
pub const FEE_SERVICE: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS monthly_fees (
        fee_id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        park_id BIGINT NOT NULL,
        billing_month TEXT NOT NULL,
        amount_cents BIGINT NOT NULL CHECK (amount_cents >= 0),
        status TEXT NOT NULL DEFAULT 'unpaid',
        paid_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT monthly_fees_owner_space_month UNIQUE (user_id, park_id, billing_month)
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_monthly_fees_user ON monthly_fees(user_id, billing_month)",
    r"
    CREATE TABLE IF NOT EXISTS processing_ledger (
        event_id UUID NOT NULL,
        consumer_name TEXT NOT NULL,
        processed_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (event_id, consumer_name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS fee_notifications (
        id BIGSERIAL PRIMARY KEY,
        fee_id BIGINT NOT NULL,
        user_id BIGINT NOT NULL,
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    ",
    OUTBOX,
    OUTBOX_DUE_INDEX,
];

/// parking-service: assignments and outbox.
pub const PARKING_SERVICE: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS owner_parking (
        assignment_id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        park_id BIGINT NOT NULL,
        park_num TEXT,
        car_number TEXT NOT NULL,
        entry_time TIMESTAMPTZ NOT NULL,
        exit_time TIMESTAMPTZ,
        status TEXT NOT NULL DEFAULT 'active'
    )
    ",
    "CREATE UNIQUE INDEX IF NOT EXISTS owner_parking_active_user ON owner_parking(user_id) WHERE status = 'active'",
    "CREATE UNIQUE INDEX IF NOT EXISTS owner_parking_active_space ON owner_parking(park_id) WHERE status = 'active'",
    OUTBOX,
    OUTBOX_DUE_INDEX,
];

/// user-service: owner profiles.
pub const USER_SERVICE: &[&str] = &[r"
    CREATE TABLE IF NOT EXISTS owners (
        user_id BIGINT PRIMARY KEY,
        owner_name TEXT NOT NULL,
        phone TEXT,
        user_type TEXT NOT NULL DEFAULT 'NORMAL'
    )
    "];

/// Run `statements` in order.
///
/// # Errors
///
/// Returns [`StoreError`] if any statement fails.
pub async fn migrate(pool: &PgPool, statements: &[&str]) -> Result<(), StoreError> {
    let mut conn = pool.acquire().await.map_err(map_sqlx)?;
    for statement in statements {
        sqlx::query(statement).execute(&mut *conn).await.map_err(map_sqlx)?;
    }
    tracing::info!(statements = statements.len(), "Schema migrated");
    Ok(())
}
