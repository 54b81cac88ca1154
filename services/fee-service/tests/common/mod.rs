#![allow(dead_code, clippy::unwrap_used)]

use chrono::{TimeZone, Utc};
use fee_service::{AppState, FeePaymentOrchestrator};
use fee_service::config::DownstreamConfig;
use parkflow_core::envelope::ApiEnvelope;
use parkflow_core::model::{ActiveParkingRecord, FeeRecord, Money, NewFeeRecord, OwnerProfile, ParkId, UserId, UserTier};
use parkflow_runtime::client::Transport;
use parkflow_runtime::{EventPublisher, RetryPolicy};
use parkflow_testing::{InMemoryBroker, InMemoryFeeStore, StubTransport, init_test_tracing, test_clock};
use std::sync::Arc;

pub const RECORD_PATH: &str = "/parking/owner/record";

pub struct Harness {
    pub store: InMemoryFeeStore,
    pub broker: InMemoryBroker,
    pub downstream: StubTransport,
    pub payments: FeePaymentOrchestrator,
}

impl Harness {
    pub fn new() -> Self {
        init_test_tracing();
        let store = InMemoryFeeStore::new();
        let broker = InMemoryBroker::with_parking_topology(5);
        let downstream = StubTransport::new();
        let clock = Arc::new(test_clock());

        let publisher = EventPublisher::new(Arc::new(broker.clone()), clock.clone())
            .with_retry_policy(RetryPolicy::builder().max_retries(0).build());
        let config = DownstreamConfig {
            user_service_url: "http://user-service".into(),
            parking_service_url: "http://parking-service".into(),
            timeout_ms: 200,
            breaker_failure_threshold: 3,
            breaker_window_secs: 30,
            breaker_cooldown_secs: 60,
        };
        let transport: Arc<dyn Transport> = Arc::new(downstream.clone());
        let (users, parking) = fee_service::app::downstream_clients(&config, &transport);

        let payments = FeePaymentOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(store.outbox().clone()),
            users,
            parking,
            publisher,
            clock,
        );

        Self {
            store,
            broker,
            downstream,
            payments,
        }
    }

    pub fn with_payer(self, id: i64) -> Self {
        self.downstream.respond_json(
            &format!("/user/owners/{id}"),
            &ApiEnvelope::ok(OwnerProfile {
                user_id: UserId::new(id),
                owner_name: "Wang Fang".into(),
                phone: None,
                user_type: UserTier::Normal,
            }),
        );
        self
    }

    pub fn with_active_space(self, user: i64, park: i64) -> Self {
        self.downstream.respond_json(
            RECORD_PATH,
            &ApiEnvelope::ok(ActiveParkingRecord {
                user_id: UserId::new(user),
                park_id: ParkId::new(park),
                park_num: Some(format!("B-{park}")),
                car_num: Some("ABC-123".into()),
            }),
        );
        self
    }

    pub fn unpaid_fee(&self, user: i64, park: i64) -> FeeRecord {
        self.store.insert_fee(
            NewFeeRecord {
                user_id: UserId::new(user),
                park_id: ParkId::new(park),
                billing_month: "2025-06".parse().unwrap(),
                amount: Money::from_cents(30_000),
            },
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        )
    }

    pub fn app(&self) -> axum::Router {
        fee_service::router(AppState {
            fees: Arc::new(self.store.clone()),
            payments: self.payments.clone(),
        })
    }
}
