#![allow(dead_code)]

use parking_service::{AppState, AssignmentService};
use parkflow_core::envelope::ApiEnvelope;
use parkflow_core::model::{OwnerProfile, UserId, UserTier};
use parkflow_runtime::client::Transport;
use parkflow_runtime::directory::UserDirectoryClient;
use parkflow_runtime::{CircuitBreakerConfig, EventPublisher, RetryPolicy, ServiceClient};
use parkflow_testing::{InMemoryAssignmentStore, InMemoryBroker, StubTransport, test_clock};
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub store: InMemoryAssignmentStore,
    pub broker: InMemoryBroker,
    pub users: StubTransport,
    pub service: AssignmentService,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryAssignmentStore::new();
        let broker = InMemoryBroker::with_parking_topology(5);
        let users = StubTransport::new();
        let clock = Arc::new(test_clock());

        let publisher = EventPublisher::new(Arc::new(broker.clone()), clock.clone())
            .with_retry_policy(RetryPolicy::builder().max_retries(0).build());
        let transport: Arc<dyn Transport> = Arc::new(users.clone());
        let client = ServiceClient::new(
            "user-service",
            "http://user-service",
            transport,
            CircuitBreakerConfig::default(),
            Duration::from_millis(200),
        );

        let service = AssignmentService::new(
            Arc::new(store.clone()),
            Arc::new(store.outbox().clone()),
            UserDirectoryClient::new(client),
            publisher,
            clock,
        );

        Self {
            store,
            broker,
            users,
            service,
        }
    }

    pub fn with_owner(self, id: i64) -> Self {
        self.users.respond_json(
            &format!("/user/owners/{id}"),
            &ApiEnvelope::ok(OwnerProfile {
                user_id: UserId::new(id),
                owner_name: "Zhang San".into(),
                phone: None,
                user_type: UserTier::Normal,
            }),
        );
        self
    }

    pub fn app(&self) -> axum::Router {
        parking_service::router(AppState {
            assignments: self.service.clone(),
        })
    }
}
