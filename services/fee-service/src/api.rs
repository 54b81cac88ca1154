//! Owner fee API.
//!
//! The caller is identified by the `X-User-Id` header forwarded by the
//! gateway; every route only exposes the caller's own fees.
//!
//! ```text
//! GET  /fee/owner/my-fees
//! GET  /fee/owner/unpaid
//! GET  /fee/owner/notifications
//! GET  /fee/owner/{feeId}
//! POST /fee/owner/pay?parkFeeId=
//! ```

use crate::orchestrator::{FeePaymentOrchestrator, PaidFee, PaymentError};
use axum::{
    Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    routing::{get, post},
};
use parkflow_core::model::{FeeId, FeeNotification, FeeRecord};
use parkflow_core::store::FeeRepository;
use parkflow_web::{AppError, CallerId, CorrelationId, WebResult, correlation_id_layer, ok};
use serde::Deserialize;
use std::sync::Arc;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Fee reads
    pub fees: Arc<dyn FeeRepository>,
    /// Payment workflow
    pub payments: FeePaymentOrchestrator,
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let message = err.to_string();
        match err {
            PaymentError::DependencyUnavailable { service, reason } => {
                Self::unavailable(format!("{service} unavailable, please retry"))
                    .with_source(anyhow::anyhow!(reason))
            }
            PaymentError::PayerNotFound(_) | PaymentError::FeeNotFound(_) => Self::missing(message),
            // Indistinguishable from an unknown fee.
            PaymentError::NotOwner { fee_id, .. } => Self::missing(PaymentError::FeeNotFound(fee_id).to_string()),
            PaymentError::AlreadyPaid(_) => Self::conflict(message),
            PaymentError::NoActiveAssignment(_) | PaymentError::RecordMismatch { .. } => Self::validation(message),
            PaymentError::Storage(e) => e.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayParams {
    park_fee_id: i64,
}

async fn my_fees(State(state): State<AppState>, CallerId(caller): CallerId) -> WebResult<Vec<FeeRecord>> {
    ok(state.fees.fees_for_user(caller).await?)
}

async fn unpaid_fees(State(state): State<AppState>, CallerId(caller): CallerId) -> WebResult<Vec<FeeRecord>> {
    ok(state.fees.unpaid_fees_for_user(caller).await?)
}

async fn notifications(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
) -> WebResult<Vec<FeeNotification>> {
    ok(state.fees.notifications_for_user(caller).await?)
}

async fn fee_detail(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(fee_id): Path<String>,
) -> WebResult<FeeRecord> {
    let fee_id: i64 = fee_id
        .parse()
        .map_err(|_| AppError::bad_request(format!("Invalid fee id: {fee_id}")))?;

    // Another owner's fee is reported as absent.
    match state.fees.find_fee(FeeId::new(fee_id)).await? {
        Some(fee) if fee.user_id == caller => ok(fee),
        _ => Err(AppError::not_found("Fee", fee_id)),
    }
}

async fn pay(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    correlation_id: CorrelationId,
    params: Result<Query<PayParams>, QueryRejection>,
) -> WebResult<PaidFee> {
    let Query(params) = params.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let paid = state
        .payments
        .pay_fee(FeeId::new(params.park_fee_id), caller, Some(correlation_id.as_str()))
        .await?;
    ok(paid)
}

/// Service routes, without the operational endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/fee/owner/my-fees", get(my_fees))
        .route("/fee/owner/unpaid", get(unpaid_fees))
        .route("/fee/owner/notifications", get(notifications))
        .route("/fee/owner/pay", post(pay))
        .route("/fee/owner/:fee_id", get(fee_detail))
        .with_state(state)
        .layer(correlation_id_layer())
}
