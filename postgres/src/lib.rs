//! `PostgreSQL` storage for the parking-fee services.
//!
//! Each service owns its database; this crate provides the adapters for all
//! three, sharing one error mapping and one outbox implementation:
//!
//! - [`PgFeeStore`]: fees, processing ledger and notifications (fee-service)
//! - [`PgAssignmentStore`]: owner assignments (parking-service)
//! - [`PgOwnerDirectory`]: owner profiles (user-service)
//! - [`PgOutbox`]: publication tracking for events recorded by the first two
//!
//! # Example
//!
//! ```no_run
//! use parkflow_postgres::{connect, schema, PgFeeStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = connect("postgres://localhost/fees", 10).await?;
//! schema::migrate(&pool, schema::FEE_SERVICE).await?;
//! let store = PgFeeStore::new(pool);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod fees;
mod outbox;
mod owners;
mod parking;
pub mod schema;

pub use fees::PgFeeStore;
pub use outbox::PgOutbox;
pub use owners::PgOwnerDirectory;
pub use parking::PgAssignmentStore;

use parkflow_core::store::StoreError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))
}
