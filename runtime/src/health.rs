//! Readiness reporting.
//!
//! Each service's `GET /ready` aggregates one [`HealthCheck`] per dependency:
//! the datastore, and one per downstream circuit breaker. An open breaker
//! makes the service *degraded* rather than unhealthy, because payment still
//! answers (with a degraded-dependency rejection) while it is open.

use crate::circuit_breaker::{CircuitBreaker, State};
use serde::Serialize;

/// Health check status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but a dependency is impaired
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Details, present when not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }

    /// Check derived from a downstream circuit breaker.
    #[must_use]
    pub fn for_breaker(breaker: &CircuitBreaker) -> Self {
        let rejected = breaker.metrics().total_rejections;
        match breaker.state() {
            State::Closed => Self::healthy(breaker.name()),
            State::HalfOpen => Self::degraded(breaker.name(), "circuit half-open, probing"),
            State::Open => Self::degraded(
                breaker.name(),
                format!("circuit open, {rejected} calls short-circuited so far"),
            ),
        }
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Create a new health report from checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Whether the service should receive traffic.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        !self.status.is_unhealthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;

    #[test]
    fn worst_status_wins() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("database"),
            HealthCheck::degraded("user-service", "circuit open"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert!(report.is_ready());

        let report = HealthReport::new(vec![HealthCheck::unhealthy("database", "pool timed out")]);
        assert!(!report.is_ready());
    }

    #[test]
    fn open_breaker_degrades() {
        let breaker = CircuitBreaker::new("parking-service", CircuitBreakerConfig::default());
        assert!(HealthCheck::for_breaker(&breaker).status.is_healthy());
        breaker.trip();
        assert_eq!(HealthCheck::for_breaker(&breaker).status, HealthStatus::Degraded);
    }
}
