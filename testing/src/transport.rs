//! Scripted HTTP transport for service clients.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Poisoned locks only occur after a test already panicked

use async_trait::async_trait;
use parkflow_core::envelope::ApiEnvelope;
use parkflow_runtime::client::{Transport, TransportError, TransportRequest, TransportResponse};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug)]
enum Scripted {
    Respond { status: u16, body: Vec<u8> },
    Unreachable,
    Stall(Duration),
}

#[derive(Debug, Default)]
struct StubState {
    routes: HashMap<String, Scripted>,
    down: bool,
    requests: Vec<TransportRequest>,
}

/// [`Transport`] that answers by URL path.
///
/// Paths without a scripted reply get a `404` envelope. [`StubTransport::set_down`]
/// makes every request fail as a connection error until switched back.
///
/// # Example
///
/// ```
/// use parkflow_core::envelope::ApiEnvelope;
/// use parkflow_testing::StubTransport;
///
/// let users = StubTransport::new();
/// users.respond_json("/user/owners/7", &ApiEnvelope::ok(serde_json::json!({"userId": 7})));
/// users.set_down(true);
/// ```
#[derive(Clone, Debug, Default)]
pub struct StubTransport {
    state: Arc<Mutex<StubState>>,
}

impl StubTransport {
    /// Transport with no scripted replies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `path` with HTTP 200 and `envelope` as JSON.
    pub fn respond_json<T: Serialize>(&self, path: &str, envelope: &ApiEnvelope<T>) {
        let body = serde_json::to_vec(envelope).unwrap();
        self.respond(path, 200, body);
    }

    /// Answer `path` with a raw status and body.
    pub fn respond(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.script(path, Scripted::Respond {
            status,
            body: body.into(),
        });
    }

    /// Fail requests to `path` as a connection error.
    pub fn unreachable(&self, path: &str) {
        self.script(path, Scripted::Unreachable);
    }

    /// Delay requests to `path` by `delay` before failing them.
    pub fn stall(&self, path: &str, delay: Duration) {
        self.script(path, Scripted::Stall(delay));
    }

    /// Fail every request while `down` is set.
    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Number of requests whose URL ends with `path`.
    #[must_use]
    pub fn calls_to(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.url.ends_with(path))
            .count()
    }

    fn script(&self, path: &str, reply: Scripted) {
        self.state.lock().unwrap().routes.insert(path.to_string(), reply);
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn get(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            if state.down {
                Scripted::Unreachable
            } else {
                state
                    .routes
                    .iter()
                    .find(|(path, _)| request.url.ends_with(path.as_str()))
                    .map(|(_, reply)| reply.clone())
                    .unwrap_or_else(|| Scripted::Respond {
                        status: 404,
                        body: serde_json::to_vec(&ApiEnvelope::<()>::rejected(404, "not found")).unwrap(),
                    })
            }
        };

        match reply {
            Scripted::Respond { status, body } => Ok(TransportResponse { status, body }),
            Scripted::Unreachable => Err(TransportError::Connect("connection refused".to_string())),
            Scripted::Stall(delay) => {
                tokio::time::sleep(delay).await;
                Err(TransportError::Timeout)
            }
        }
    }
}
