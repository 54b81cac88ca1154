//! Prometheus metrics for the messaging and cross-service layers.
//!
//! [`PrometheusMetrics::install`] registers the global recorder once per
//! process; each service renders it on `GET /metrics`.
//!
//! # Example
//!
//! ```rust,no_run
//! use parkflow_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let metrics = PrometheusMetrics::install()?;
//! let body = metrics.render();
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installed Prometheus recorder.
#[derive(Clone)]
pub struct PrometheusMetrics {
    handle: PrometheusHandle,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Describe all metrics and install the global Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed in
    /// this process; call this once, from `main`.
    pub fn install() -> Result<Self, MetricsError> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        tracing::info!("Prometheus recorder installed");

        Ok(Self { handle })
    }

    /// Render current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn register_metrics() {
    // Publisher
    describe_counter!(
        "events_published_total",
        "Events handed to the broker, by routing key"
    );
    describe_counter!(
        "publish_confirms_total",
        "Asynchronous publish outcomes (acked, nacked, returned)"
    );

    // Consumers
    describe_counter!(
        "deliveries_total",
        "Deliveries settled, by consumer and disposition"
    );

    // Cross-service calls
    describe_counter!(
        "downstream_calls_total",
        "Calls to downstream services, by service and outcome"
    );
    describe_histogram!(
        "downstream_call_duration_seconds",
        "Latency of attempted downstream calls"
    );
    describe_gauge!(
        "circuit_breaker_state",
        "Circuit breaker state per service (0=closed, 1=half-open, 2=open)"
    );

    // Orchestration
    describe_counter!(
        "fee_payments_total",
        "Fee payment attempts, by outcome"
    );

    // Outbox
    describe_counter!(
        "outbox_replays_total",
        "Outbox events republished by the reconciliation sweep"
    );
    describe_counter!(
        "outbox_failures_total",
        "Outbox rows marked failed after a nack, return or send error"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their retries"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record an event handed to the broker.
    pub fn record_publish(routing_key: &'static str) {
        counter!("events_published_total", "routing_key" => routing_key).increment(1);
    }

    /// Record a publish outcome.
    pub fn record_confirm(outcome: &'static str) {
        counter!("publish_confirms_total", "outcome" => outcome).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a settled delivery.
    pub fn record_disposition(consumer: &str, disposition: &'static str) {
        counter!(
            "deliveries_total",
            "consumer" => consumer.to_string(),
            "disposition" => disposition
        )
        .increment(1);
    }
}

/// Cross-service call metrics recorder.
pub struct DownstreamMetrics;

impl DownstreamMetrics {
    /// Record a call outcome and, for attempted calls, its latency.
    pub fn record_call(service: &str, outcome: &'static str, duration: Option<Duration>) {
        counter!(
            "downstream_calls_total",
            "service" => service.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        if let Some(duration) = duration {
            histogram!("downstream_call_duration_seconds", "service" => service.to_string())
                .record(duration.as_secs_f64());
        }
    }
}

/// Fee payment metrics recorder.
pub struct PaymentMetrics;

impl PaymentMetrics {
    /// Record a payment attempt outcome (`paid` or a rejection reason code).
    pub fn record_outcome(outcome: &'static str) {
        counter!("fee_payments_total", "outcome" => outcome).increment(1);
    }
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record a republished outbox event.
    pub fn record_replay() {
        counter!("outbox_replays_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_do_not_require_installed_exporter() {
        // Without a global recorder the macros are no-ops.
        PublisherMetrics::record_publish("fee.paid");
        PublisherMetrics::record_confirm("acked");
        ConsumerMetrics::record_disposition("fee-assignment", "applied");
        DownstreamMetrics::record_call("user-service", "ok", Some(Duration::from_millis(3)));
        PaymentMetrics::record_outcome("paid");
        OutboxMetrics::record_replay();
    }
}
