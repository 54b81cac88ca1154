//! Correlation id middleware.
//!
//! 1. **Extract** the id from `X-Correlation-ID`, or generate one
//! 2. **Store** it in request extensions as a [`CorrelationId`]
//! 3. **Run** the request inside an `http_request` span carrying the id
//! 4. **Echo** the id in the response `X-Correlation-ID` header
//!
//! Handlers forward the same id to downstream services and put it on the
//! events they publish, so one payment can be followed across all three
//! services.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/fee/owner/unpaid", get(unpaid))
//!     .layer(correlation_id_layer());
//! ```

use crate::extractors::CorrelationId;
use axum::{extract::Request, http::HeaderValue, response::Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Create a layer that adds correlation ID tracking to all requests.
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Copy, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(CorrelationId::parse)
            .unwrap_or_else(CorrelationId::generate);

        req.extensions_mut().insert(correlation_id.clone());

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            uri = %req.uri(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;

            if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
                response.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> Router {
        Router::new()
            .route("/test", get(|| async { "ok" }))
            .layer(correlation_id_layer())
    }

    #[tokio::test]
    async fn test_correlation_id_generated_if_missing() {
        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();

        let correlation_id = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .expect("Correlation ID header should be present");
        assert!(Uuid::parse_str(correlation_id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_correlation_id_preserved_from_request() {
        let request = Request::builder()
            .uri("/test")
            .header("X-Correlation-ID", "gateway-7f3a")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let echoed = response.headers().get(CORRELATION_ID_HEADER).unwrap().to_str().unwrap();
        assert_eq!(echoed, "gateway-7f3a");
    }

    #[tokio::test]
    async fn test_correlation_id_reaches_handler() {
        async fn handler(id: CorrelationId) -> String {
            id.to_string()
        }

        let app = Router::new().route("/test", get(handler)).layer(correlation_id_layer());
        let request = Request::builder()
            .uri("/test")
            .header("X-Correlation-ID", "abc-123")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abc-123");
    }

    #[tokio::test]
    async fn test_unprintable_id_replaced() {
        let request = Request::builder()
            .uri("/test")
            .header("X-Correlation-ID", "two words")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let echoed = response.headers().get(CORRELATION_ID_HEADER).unwrap().to_str().unwrap();
        assert_ne!(echoed, "two words");
        assert!(Uuid::parse_str(echoed).is_ok());
    }
}
