//! Custom Axum extractors.
//!
//! - [`CorrelationId`]: the request's correlation id, as set by
//!   [`correlation_id_layer`](crate::middleware::correlation_id_layer)
//! - [`CallerId`]: the authenticated owner, forwarded by the gateway in
//!   `X-User-Id`
//!
//! # Examples
//!
//! ```ignore
//! use parkflow_web::extractors::{CallerId, CorrelationId};
//!
//! async fn my_fees(
//!     State(state): State<AppState>,
//!     CallerId(user_id): CallerId,
//!     correlation_id: CorrelationId,
//! ) -> Result<Json<ApiEnvelope<Vec<FeeRecord>>>, AppError> {
//!     tracing::info!(%user_id, correlation_id = %correlation_id.0, "Listing fees");
//!     Ok(Json(ApiEnvelope::ok(state.fees.fees_for_user(user_id).await?)))
//! }
//! ```

use crate::error::AppError;
use crate::middleware::CORRELATION_ID_HEADER;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use parkflow_core::model::UserId;
use uuid::Uuid;

/// Header the gateway sets after validating the caller's token.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Correlation id for request tracing.
///
/// Taken from the request extensions when the middleware is installed,
/// otherwise from the `X-Correlation-ID` header, otherwise freshly generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// A new random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a client-supplied id if it is short, printable ASCII.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let acceptable = !raw.is_empty() && raw.len() <= 128 && raw.bytes().all(|b| b.is_ascii_graphic());
        acceptable.then(|| Self(raw.to_string()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<Self>() {
            return Ok(id.clone());
        }

        let id = parts
            .headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
            .unwrap_or_else(Self::generate);

        Ok(id)
    }
}

/// The calling owner.
///
/// Rejects with 401 and the standard envelope when `X-User-Id` is missing or
/// not a positive integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerId(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("Missing caller identity"))?;

        match raw.trim().parse::<i64>() {
            Ok(id) if id > 0 => Ok(Self(UserId::new(id))),
            _ => Err(AppError::unauthorized("Invalid caller identity")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn caller_id_from_header() {
        let mut parts = parts(&[("X-User-Id", "7")]);
        let CallerId(user) = CallerId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user, UserId::new(7));
    }

    #[tokio::test]
    async fn caller_id_rejects_missing_or_invalid() {
        for headers in [vec![], vec![("X-User-Id", "abc")], vec![("X-User-Id", "-3")]] {
            let mut parts = parts(&headers);
            let err = CallerId::from_request_parts(&mut parts, &()).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn correlation_id_prefers_extension() {
        let mut parts = parts(&[("X-Correlation-ID", "from-header")]);
        parts.extensions.insert(CorrelationId("from-middleware".into()));

        let id = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(id.as_str(), "from-middleware");
    }

    #[tokio::test]
    async fn correlation_id_falls_back_to_header_then_generates() {
        let mut with_header = parts(&[("X-Correlation-ID", "req-42")]);
        let id = CorrelationId::from_request_parts(&mut with_header, &()).await.unwrap();
        assert_eq!(id.as_str(), "req-42");

        let mut bare = parts(&[]);
        let id = CorrelationId::from_request_parts(&mut bare, &()).await.unwrap();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn parse_rejects_unprintable_and_oversized() {
        assert!(CorrelationId::parse("has space").is_none());
        assert!(CorrelationId::parse("").is_none());
        assert!(CorrelationId::parse(&"x".repeat(129)).is_none());
        assert!(CorrelationId::parse(" trimmed ").is_some());
    }
}
