//! user-service datastore: owner profiles.

use crate::error::{corrupt, map_sqlx};
use async_trait::async_trait;
use parkflow_core::model::{OwnerProfile, UserId, UserTier};
use parkflow_core::store::{OwnerDirectory, StoreError};
use sqlx::{PgPool, Row};

/// `PostgreSQL`-backed [`OwnerDirectory`].
#[derive(Clone, Debug)]
pub struct PgOwnerDirectory {
    pool: PgPool,
}

impl PgOwnerDirectory {
    /// Directory over the user-service pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace an owner profile.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on datastore failure.
    pub async fn upsert_owner(&self, owner: &OwnerProfile) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO owners (user_id, owner_name, phone, user_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET owner_name = EXCLUDED.owner_name,
                phone = EXCLUDED.phone,
                user_type = EXCLUDED.user_type
            ",
        )
        .bind(owner.user_id.get())
        .bind(&owner.owner_name)
        .bind(owner.phone.as_deref())
        .bind(owner.user_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
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
}

#[async_trait]
impl OwnerDirectory for PgOwnerDirectory {
    async fn find_owner(&self, user_id: UserId) -> Result<Option<OwnerProfile>, StoreError> {
        let row = sqlx::query("SELECT user_id, owner_name, phone, user_type FROM owners WHERE user_id = $1")
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let user_type: String = row.try_get("user_type").map_err(map_sqlx)?;

        Ok(Some(OwnerProfile {
            user_id: UserId::new(row.try_get("user_id").map_err(map_sqlx)?),
            owner_name: row.try_get("owner_name").map_err(map_sqlx)?,
            phone: row.try_get("phone").map_err(map_sqlx)?,
            user_type: UserTier::parse(&user_type).map_err(|e| corrupt("user_type", e))?,
        }))
    }
}
