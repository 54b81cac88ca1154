//! HTTP API.
//!
//! ```text
//! POST /parking/parkings/assign?userId=&parkId=&carNumber=[&parkNum=]
//! POST /parking/parkings/return?userId=  |  ?parkId=
//! GET  /parking/owner/record?userId=
//! ```

use crate::assignment::{AssignRequest, AssignmentError, AssignmentService, ReturnTarget};
use axum::{
    Router,
    extract::{Query, State, rejection::QueryRejection},
    routing::{get, post},
};
use parkflow_core::model::{ActiveParkingRecord, ParkId, ParkingAssignment, UserId};
use parkflow_web::{AppError, CorrelationId, WebResult, correlation_id_layer, ok};
use serde::Deserialize;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Assignment workflow
    pub assignments: AssignmentService,
}

impl From<AssignmentError> for AppError {
    fn from(err: AssignmentError) -> Self {
        let message = err.to_string();
        match err {
            AssignmentError::InvalidRequest(message) => Self::bad_request(message),
            AssignmentError::OwnerNotFound(_) | AssignmentError::NoActiveAssignment => Self::missing(message),
            AssignmentError::UserAlreadyAssigned(_) | AssignmentError::SpaceOccupied(_) => Self::conflict(message),
            AssignmentError::DependencyUnavailable(reason) => {
                Self::unavailable("User service unavailable, please retry").with_source(anyhow::anyhow!(reason))
            }
            AssignmentError::Storage(e) => e.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignParams {
    user_id: i64,
    park_id: i64,
    car_number: String,
    park_num: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReturnParams {
    user_id: Option<i64>,
    park_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordParams {
    user_id: i64,
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(inner)| inner)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

async fn assign(
    State(state): State<AppState>,
    correlation_id: CorrelationId,
    params: Result<Query<AssignParams>, QueryRejection>,
) -> WebResult<ParkingAssignment> {
    let params = query(params)?;
    let request = AssignRequest {
        user_id: UserId::new(params.user_id),
        park_id: ParkId::new(params.park_id),
        park_num: params.park_num,
        car_number: params.car_number,
    };

    let created = state.assignments.assign(request, Some(correlation_id.as_str())).await?;
    ok(created)
}

async fn return_space(
    State(state): State<AppState>,
    params: Result<Query<ReturnParams>, QueryRejection>,
) -> WebResult<ParkingAssignment> {
    let target = match query(params)? {
        ReturnParams { user_id: Some(user), park_id: None } => ReturnTarget::User(UserId::new(user)),
        ReturnParams { user_id: None, park_id: Some(park) } => ReturnTarget::Space(ParkId::new(park)),
        _ => return Err(AppError::bad_request("Exactly one of userId or parkId is required")),
    };

    ok(state.assignments.return_space(target).await?)
}

async fn owner_record(
    State(state): State<AppState>,
    params: Result<Query<RecordParams>, QueryRejection>,
) -> WebResult<ActiveParkingRecord> {
    let params = query(params)?;
    ok(state.assignments.active_record(UserId::new(params.user_id)).await?)
}

/// Service routes, without the operational endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/parking/parkings/assign", post(assign))
        .route("/parking/parkings/return", post(return_space))
        .route("/parking/owner/record", get(owner_record))
        .with_state(state)
        .layer(correlation_id_layer())
}
