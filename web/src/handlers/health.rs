//! Liveness, readiness and metrics endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems:
//!
//! ```text
//! GET /health   liveness, never touches dependencies
//! GET /ready    readiness, 503 when any dependency is unhealthy
//! GET /metrics  Prometheus text format
//! ```
//!
//! An open downstream circuit reports `degraded`, not `unhealthy`: the service
//! still answers the requests that do not need that dependency.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use parkflow_runtime::health::{HealthCheck, HealthReport};
use parkflow_runtime::metrics::PrometheusMetrics;
use serde::Serialize;
use std::sync::Arc;

/// Supplies the dependency checks behind `GET /ready`.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// Check every dependency the service needs.
    async fn checks(&self) -> Vec<HealthCheck>;
}

/// State shared by the operational endpoints.
#[derive(Clone)]
pub struct OpsState {
    service: &'static str,
    version: &'static str,
    probe: Arc<dyn ReadinessProbe>,
    metrics: Option<PrometheusMetrics>,
}

impl std::fmt::Debug for OpsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpsState")
            .field("service", &self.service)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl OpsState {
    /// Endpoints for `service` at `version`, readiness from `probe`.
    #[must_use]
    pub fn new(service: &'static str, version: &'static str, probe: Arc<dyn ReadinessProbe>) -> Self {
        Self {
            service,
            version,
            probe,
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from this recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: PrometheusMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Liveness {
    /// Always `"ok"`
    pub status: &'static str,
    /// Service name
    pub service: &'static str,
    /// Build version
    pub version: &'static str,
}

/// Simple health check endpoint (for basic liveness).
#[allow(clippy::unused_async)]
pub async fn health_check(State(state): State<OpsState>) -> Json<Liveness> {
    Json(Liveness {
        status: "ok",
        service: state.service,
        version: state.version,
    })
}

/// Readiness: 200 when healthy or degraded, 503 when unhealthy.
pub async fn readiness(State(state): State<OpsState>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::new(state.probe.checks().await);

    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        tracing::warn!(service = state.service, status = ?report.status, "Readiness check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}

/// Prometheus scrape endpoint.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<OpsState>) -> Result<impl IntoResponse, AppError> {
    let metrics = state
        .metrics
        .as_ref()
        .ok_or_else(|| AppError::missing("Metrics recorder not installed"))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    ))
}

/// Router serving `/health`, `/ready` and `/metrics`, ready to merge into a
/// service router.
pub fn ops_router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Fixed(Vec<HealthCheck>);

    #[async_trait]
    impl ReadinessProbe for Fixed {
        async fn checks(&self) -> Vec<HealthCheck> {
            self.0.clone()
        }
    }

    fn router(checks: Vec<HealthCheck>) -> Router {
        ops_router(OpsState::new("fee-service", "0.1.0", Arc::new(Fixed(checks))))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = get_json(router(vec![HealthCheck::unhealthy("database", "down")]), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "fee-service");
    }

    #[tokio::test]
    async fn degraded_dependency_is_still_ready() {
        let (status, body) = get_json(
            router(vec![
                HealthCheck::healthy("database"),
                HealthCheck::degraded("user-service", "circuit open"),
            ]),
            "/ready",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["checks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unhealthy_dependency_fails_readiness() {
        let (status, body) = get_json(router(vec![HealthCheck::unhealthy("database", "pool timed out")]), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_not_found() {
        let (status, body) = get_json(router(Vec::new()), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 404);
    }
}
