//! Payment gating against scripted user-service and parking-service replies.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Harness, RECORD_PATH};
use fee_service::PaymentError;
use parkflow_core::envelope::ApiEnvelope;
use parkflow_core::environment::Clock;
use parkflow_core::event::{DomainEvent, EventType};
use parkflow_core::model::{FeeId, FeeStatus, UserId};
use parkflow_core::store::OutboxStatus;
use parkflow_core::topology::NOTIFICATION_QUEUE;
use parkflow_testing::test_clock;

fn status_of(h: &Harness, fee_id: FeeId) -> FeeStatus {
    h.store.fees().into_iter().find(|f| f.fee_id == fee_id).unwrap().status
}

#[tokio::test]
async fn valid_payment_settles_fee_and_publishes_fee_paid() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);

    let paid = h.payments.pay_fee(fee.fee_id, UserId::new(7), Some("pay-1")).await.unwrap();

    assert_eq!(paid.fee.status, FeeStatus::Paid);
    assert_eq!(paid.fee.paid_at, Some(test_clock().now()));
    assert_eq!(status_of(&h, fee.fee_id), FeeStatus::Paid);

    let published = h.broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].correlation_id.as_deref(), Some("pay-1"));
    let event = DomainEvent::from_body(EventType::FeePaid, &published[0].body, None).unwrap();
    assert_eq!(event.event_id, paid.event_id);
    let payload = event.as_fee_paid().unwrap();
    assert_eq!(payload.fee_id, fee.fee_id);
    assert_eq!(payload.payment_month.to_string(), "2025-06");
    assert_eq!(payload.payment_amount.to_string(), "300.00");

    assert_eq!(h.broker.queue_depth(NOTIFICATION_QUEUE), 1);
    assert_eq!(h.store.outbox().entries().len(), 1);
}

#[tokio::test]
async fn space_mismatch_leaves_fee_unpaid() {
    let h = Harness::new().with_payer(7).with_active_space(7, 9);
    let fee = h.unpaid_fee(7, 3);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err, PaymentError::RecordMismatch { fee_id: fee.fee_id });
    assert_eq!(status_of(&h, fee.fee_id), FeeStatus::Unpaid);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn concurrent_payments_of_one_fee_settle_once() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);

    let (a, b) = tokio::join!(
        h.payments.pay_fee(fee.fee_id, UserId::new(7), None),
        h.payments.pay_fee(fee.fee_id, UserId::new(7), None),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|r| matches!(r, Err(PaymentError::AlreadyPaid(id)) if *id == fee.fee_id)));
    assert_eq!(h.broker.published().len(), 1);
}

#[tokio::test]
async fn paying_a_paid_fee_is_already_paid() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap();

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err, PaymentError::AlreadyPaid(fee.fee_id));
    // Refused before parking-service is consulted again.
    assert_eq!(h.downstream.calls_to(RECORD_PATH), 1);
}

#[tokio::test]
async fn open_user_breaker_fails_fast_without_writes() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    h.payments.users().inner().breaker().trip();

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert!(matches!(err, PaymentError::DependencyUnavailable { service: "user-service", .. }));
    assert_eq!(h.downstream.calls_to("/user/owners/7"), 0);
    assert_eq!(status_of(&h, fee.fee_id), FeeStatus::Unpaid);
    assert!(h.broker.published().is_empty());
}

#[tokio::test]
async fn repeated_user_service_outage_opens_the_breaker() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    h.downstream.set_down(true);

    for _ in 0..3 {
        let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();
        assert_eq!(err.reason(), "dependency_unavailable");
    }
    let calls = h.downstream.calls_to("/user/owners/7");

    h.downstream.set_down(false);
    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err.reason(), "dependency_unavailable");
    assert_eq!(h.downstream.calls_to("/user/owners/7"), calls);
}

#[tokio::test]
async fn parking_service_outage_is_dependency_unavailable() {
    let h = Harness::new().with_payer(7);
    h.downstream.unreachable(RECORD_PATH);
    let fee = h.unpaid_fee(7, 3);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert!(matches!(err, PaymentError::DependencyUnavailable { service: "parking-service", .. }));
}

#[tokio::test]
async fn slow_parking_service_times_out() {
    let h = Harness::new().with_payer(7);
    h.downstream.stall(RECORD_PATH, std::time::Duration::from_secs(5));
    let fee = h.unpaid_fee(7, 3);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert!(matches!(err, PaymentError::DependencyUnavailable { service: "parking-service", .. }));
    assert_eq!(status_of(&h, fee.fee_id), FeeStatus::Unpaid);
}

#[tokio::test]
async fn unknown_payer_is_refused() {
    let h = Harness::new().with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err, PaymentError::PayerNotFound(UserId::new(7)));
}

#[tokio::test]
async fn fee_checks_run_in_order() {
    let h = Harness::new().with_payer(7).with_payer(8).with_active_space(8, 3);
    let fee = h.unpaid_fee(7, 3);

    assert_eq!(
        h.payments.pay_fee(FeeId::new(999), UserId::new(7), None).await.unwrap_err(),
        PaymentError::FeeNotFound(FeeId::new(999))
    );
    assert_eq!(
        h.payments.pay_fee(fee.fee_id, UserId::new(8), None).await.unwrap_err(),
        PaymentError::NotOwner {
            fee_id: fee.fee_id,
            payer: UserId::new(8)
        }
    );
}

#[tokio::test]
async fn payer_without_assignment_is_refused() {
    let h = Harness::new().with_payer(7);
    h.downstream.respond_json(
        RECORD_PATH,
        &ApiEnvelope::<()>::rejected(404, "No active parking assignment"),
    );
    let fee = h.unpaid_fee(7, 3);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err, PaymentError::NoActiveAssignment(UserId::new(7)));
}

#[tokio::test]
async fn failed_publish_keeps_payment_and_flags_outbox() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    h.broker.fail_next_publishes(1);

    let paid = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap();

    assert_eq!(status_of(&h, fee.fee_id), FeeStatus::Paid);
    assert_eq!(h.store.outbox().status(paid.event_id), Some(OutboxStatus::Failed));
}

#[tokio::test]
async fn storage_outage_is_storage_error() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    h.store.fail_next(1);

    let err = h.payments.pay_fee(fee.fee_id, UserId::new(7), None).await.unwrap_err();

    assert_eq!(err.reason(), "storage");
}
