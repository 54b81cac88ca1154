//! Axum glue shared by the parkflow services.
//!
//! Every response body, success or failure, is an
//! [`ApiEnvelope`](parkflow_core::envelope::ApiEnvelope):
//!
//! ```json
//! {"code": 200, "message": "success", "data": {...}}
//! {"code": 409, "message": "Fee already paid", "data": null}
//! ```
//!
//! Handlers return [`WebResult`], which renders `Ok` through [`ok`] and `Err`
//! through [`AppError`]. The gateway authenticates callers and forwards their
//! id in `X-User-Id`; [`CallerId`] reads it.
//!
//! # Example
//!
//! ```ignore
//! use parkflow_web::{CallerId, WebResult, ok};
//!
//! async fn unpaid(State(state): State<AppState>, CallerId(user): CallerId) -> WebResult<Vec<FeeView>> {
//!     let fees = state.fees.unpaid_fees_for_user(user).await?;
//!     ok(fees.into_iter().map(FeeView::from).collect())
//! }
//!
//! let app = Router::new()
//!     .route("/fee/owner/unpaid", get(unpaid))
//!     .with_state(state)
//!     .merge(ops_router(ops))
//!     .layer(correlation_id_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod server;

use axum::Json;
use parkflow_core::envelope::ApiEnvelope;

pub use error::AppError;
pub use extractors::{CallerId, CorrelationId, USER_ID_HEADER};
pub use handlers::{OpsState, ReadinessProbe, ops_router};
pub use middleware::{CORRELATION_ID_HEADER, correlation_id_layer};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<Json<ApiEnvelope<T>>, AppError>;

/// Wrap `data` in a success envelope.
///
/// # Errors
///
/// Never fails; the `Result` lets handlers end with `ok(value)`.
#[allow(clippy::unnecessary_wraps)]
pub fn ok<T>(data: T) -> WebResult<T> {
    Ok(Json(ApiEnvelope::ok(data)))
}
