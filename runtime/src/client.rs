//! Guarded synchronous calls to other services.
//!
//! [`ServiceClient`] wraps one downstream service with a per-call timeout and
//! a [`CircuitBreaker`]. Callers get back either the decoded `data` of the
//! service's [`ApiEnvelope`] or a [`DegradedReason`] they can branch on:
//!
//! - a reply with `code != 200` is a **business rejection**. The downstream is
//!   healthy, so the breaker records a success and the caller sees
//!   [`DegradedReason::BusinessRejected`] with the downstream message.
//! - timeouts, connection errors, 5xx responses and undecodable bodies are
//!   **infrastructure failures**. They count against the breaker and surface
//!   as [`DegradedReason::Unavailable`], as does a call short-circuited by an
//!   open circuit.
//!
//! The HTTP layer sits behind the [`Transport`] trait so tests can script
//! downstream replies without a network.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, State};
use crate::metrics::DownstreamMetrics;
use async_trait::async_trait;
use parkflow_core::envelope::ApiEnvelope;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Header carrying the request correlation id between services.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Raw reply from a [`Transport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status
    pub status: u16,
    /// Response body
    pub body: Vec<u8>,
}

/// A GET request as seen by a [`Transport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportRequest {
    /// Absolute URL without query string
    pub url: String,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// Correlation id to forward
    pub correlation_id: Option<String>,
}

/// Why a request produced no response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No response within the deadline
    #[error("Request timed out")]
    Timeout,
    /// Could not connect
    #[error("Connection failed: {0}")]
    Connect(String),
    /// Any other transport failure
    #[error("Request failed: {0}")]
    Other(String),
}

/// Performs HTTP GET requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the request and return the raw reply.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no response was received.
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport using `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        if let Some(correlation_id) = &request.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, correlation_id);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}

/// Why a downstream call yielded no usable data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DegradedReason {
    /// The service answered and refused (`code != 200`)
    #[error("{0}")]
    BusinessRejected(String),
    /// The service could not be used (timeout, error, open circuit)
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
enum CallFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Timed out after {0:?}")]
    Deadline(Duration),
    #[error("Server error: HTTP {0}")]
    Status(u16),
    #[error("Undecodable response: {0}")]
    Decode(String),
}

/// Client for one downstream service.
#[derive(Clone)]
pub struct ServiceClient {
    service: Arc<str>,
    base_url: String,
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service", &self.service)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceClient {
    /// Client for `service` at `base_url`.
    #[must_use]
    pub fn new(
        service: impl Into<Arc<str>>,
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        breaker: CircuitBreakerConfig,
        timeout: Duration,
    ) -> Self {
        let service = service.into();
        Self {
            breaker: CircuitBreaker::new(Arc::clone(&service), breaker),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service,
            transport,
            timeout,
        }
    }

    /// Name of the downstream service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The breaker guarding this service.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET `path` and return the envelope's `data`.
    ///
    /// `Ok(None)` means the service reported success with no data.
    ///
    /// # Errors
    ///
    /// Returns [`DegradedReason::BusinessRejected`] if the service replied with
    /// `code != 200`, and [`DegradedReason::Unavailable`] on timeout, transport
    /// error, server error, undecodable reply or open circuit.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        correlation_id: Option<&str>,
    ) -> Result<Option<T>, DegradedReason> {
        let request = TransportRequest {
            url: format!("{}/{}", self.base_url, path.trim_start_matches('/')),
            query: query.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect(),
            correlation_id: correlation_id.map(str::to_string),
        };

        let started = Instant::now();
        let result = self
            .breaker
            .call(|| self.attempt::<T>(request))
            .await;

        match result {
            Ok(envelope) => {
                DownstreamMetrics::record_call(&self.service, "ok", Some(started.elapsed()));
                envelope.into_result().map_err(|message| {
                    tracing::info!(service = %self.service, path, message = %message, "Downstream rejected request");
                    DegradedReason::BusinessRejected(message)
                })
            }
            Err(CircuitBreakerError::Open) => {
                DownstreamMetrics::record_call(&self.service, "short_circuited", None);
                tracing::warn!(service = %self.service, path, "Circuit open, call not attempted");
                Err(DegradedReason::Unavailable(format!("{} circuit open", self.service)))
            }
            Err(CircuitBreakerError::Inner(failure)) => {
                DownstreamMetrics::record_call(&self.service, "failed", Some(started.elapsed()));
                tracing::warn!(
                    service = %self.service,
                    path,
                    error = %failure,
                    breaker_open = self.breaker.state() == State::Open,
                    "Downstream call failed"
                );
                Err(DegradedReason::Unavailable(failure.to_string()))
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(&self, request: TransportRequest) -> Result<ApiEnvelope<T>, CallFailure> {
        let response = tokio::time::timeout(self.timeout, self.transport.get(request))
            .await
            .map_err(|_| CallFailure::Deadline(self.timeout))??;

        if response.status >= 500 {
            return Err(CallFailure::Status(response.status));
        }

        // 4xx replies still carry an envelope; only an unreadable body is a failure.
        serde_json::from_slice::<ApiEnvelope<T>>(&response.body).map_err(|e| CallFailure::Decode(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Reply {
        Respond(u16, &'static str),
        Fail,
        Hang,
    }

    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<TransportRequest>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(request);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Respond(status, body)) => Ok(TransportResponse {
                    status,
                    body: body.as_bytes().to_vec(),
                }),
                Some(Reply::Hang) => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(TransportError::Timeout)
                }
                Some(Reply::Fail) | None => Err(TransportError::Connect("refused".into())),
            }
        }
    }

    fn client(transport: Arc<Scripted>, threshold: usize) -> ServiceClient {
        ServiceClient::new(
            "user-service",
            "http://users.internal/",
            transport,
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .cooldown(Duration::from_secs(60))
                .build(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn success_returns_data_and_forwards_context() {
        let transport = Scripted::new(vec![Reply::Respond(200, r#"{"code":200,"message":"ok","data":7}"#)]);
        let client = client(Arc::clone(&transport), 3);

        let data: Option<u32> = client.get("/user/owners/7", &[("verbose", "1".into())], Some("req-9")).await.unwrap();
        assert_eq!(data, Some(7));

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].url, "http://users.internal/user/owners/7");
        assert_eq!(seen[0].correlation_id.as_deref(), Some("req-9"));
    }

    #[tokio::test]
    async fn business_rejection_is_not_a_breaker_failure() {
        let replies = (0..5)
            .map(|_| Reply::Respond(200, r#"{"code":404,"message":"owner not found","data":null}"#))
            .collect();
        let client = client(Scripted::new(replies), 2);

        for _ in 0..5 {
            let result: Result<Option<u32>, _> = client.get("owners/1", &[], None).await;
            assert_eq!(result, Err(DegradedReason::BusinessRejected("owner not found".into())));
        }
        assert_eq!(client.breaker().state(), State::Closed);
    }

    #[tokio::test]
    async fn infrastructure_failures_open_the_breaker() {
        let client = client(
            Scripted::new(vec![Reply::Fail, Reply::Respond(503, ""), Reply::Respond(200, "not json")]),
            3,
        );

        for _ in 0..3 {
            let result: Result<Option<u32>, _> = client.get("owners/1", &[], None).await;
            assert!(matches!(result, Err(DegradedReason::Unavailable(_))));
        }
        assert_eq!(client.breaker().state(), State::Open);

        let short_circuited: Result<Option<u32>, _> = client.get("owners/1", &[], None).await;
        assert!(matches!(short_circuited, Err(DegradedReason::Unavailable(reason)) if reason.contains("circuit open")));
    }

    #[tokio::test]
    async fn slow_downstream_times_out() {
        let client = client(Scripted::new(vec![Reply::Hang]), 3);
        let result: Result<Option<u32>, _> = client.get("owners/1", &[], None).await;
        assert!(matches!(result, Err(DegradedReason::Unavailable(reason)) if reason.contains("Timed out")));
    }
}
