//! HTTP API.

use axum::{
    Router,
    extract::{Path, State},
    routing::get,
};
use parkflow_core::model::{OwnerProfile, UserId};
use parkflow_core::store::OwnerDirectory;
use parkflow_web::{AppError, CorrelationId, WebResult, correlation_id_layer, ok};
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Owner profiles
    pub owners: Arc<dyn OwnerDirectory>,
}

impl AppState {
    /// State over `owners`.
    #[must_use]
    pub fn new(owners: Arc<dyn OwnerDirectory>) -> Self {
        Self { owners }
    }
}

/// `GET /user/owners/{userId}`
///
/// # Errors
///
/// 400 for a non-numeric id, 404 when the owner does not exist, 5xx when the
/// directory cannot be read.
pub async fn get_owner(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    correlation_id: CorrelationId,
) -> WebResult<OwnerProfile> {
    let user_id: i64 = raw_id
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid user id: {raw_id}")))?;
    let user_id = UserId::new(user_id);

    match state.owners.find_owner(user_id).await? {
        Some(owner) => {
            tracing::debug!(%user_id, %correlation_id, "Owner found");
            ok(owner)
        }
        None => {
            tracing::info!(%user_id, %correlation_id, "Owner not found");
            Err(AppError::not_found("Owner", user_id))
        }
    }
}

/// Service routes, without the operational endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/user/owners/:user_id", get(get_owner))
        .with_state(state)
        .layer(correlation_id_layer())
}
