//! Consumer pipeline against the in-memory broker and fee store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::{TimeZone, Utc};
use parkflow_core::broker::{AckDecision, Broker, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER};
use parkflow_core::event::{AssignmentCreated, DomainEvent, EventDraft, EventType};
use parkflow_core::model::{AssignmentId, BillingMonth, Money, NewFeeRecord, ParkId, UserId};
use parkflow_core::store::SideEffect;
use parkflow_core::topology::{DEAD_LETTER_QUEUE, DEAD_LETTER_ROUTING_KEY, FEE_ASSIGNMENT_QUEUE};
use parkflow_runtime::consumer::{
    ConsumerPool, Disposition, HandlerError, IdempotentHandler, MessageProcessor,
};
use parkflow_runtime::publisher::EventPublisher;
use parkflow_runtime::retry::RetryPolicy;
use parkflow_testing::{InMemoryBroker, InMemoryFeeStore, test_clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct FeeFromAssignment;

impl IdempotentHandler for FeeFromAssignment {
    fn consumer_name(&self) -> &str {
        "fee-assignment"
    }

    fn event_type(&self) -> EventType {
        EventType::AssignmentCreated
    }

    fn side_effect(&self, event: &DomainEvent) -> Result<SideEffect, HandlerError> {
        let assigned = event
            .as_assignment_created()
            .ok_or_else(|| HandlerError::Permanent("unexpected payload".into()))?;
        Ok(SideEffect::CreateFee(NewFeeRecord {
            user_id: assigned.user_id,
            park_id: assigned.park_id,
            billing_month: BillingMonth::from_datetime(assigned.entry_time),
            amount: Money::from_cents(30_000),
        }))
    }
}

struct Exploding;

impl IdempotentHandler for Exploding {
    fn consumer_name(&self) -> &str {
        "exploding"
    }

    fn event_type(&self) -> EventType {
        EventType::AssignmentCreated
    }

    fn side_effect(&self, _event: &DomainEvent) -> Result<SideEffect, HandlerError> {
        panic!("handler bug");
    }
}

fn assignment(user: i64, park: i64) -> EventDraft {
    EventDraft::new(AssignmentCreated {
        owner_parking_id: AssignmentId::new(user * 10 + park),
        user_id: UserId::new(user),
        park_id: ParkId::new(park),
        car_number: "B-1234".into(),
        entry_time: Utc.with_ymd_and_hms(2025, 6, 3, 8, 0, 0).unwrap(),
    })
}

struct Harness {
    broker: InMemoryBroker,
    store: InMemoryFeeStore,
    publisher: EventPublisher,
}

impl Harness {
    fn new(max_attempts: u32) -> Self {
        let broker = InMemoryBroker::with_parking_topology(max_attempts);
        let publisher = EventPublisher::new(Arc::new(broker.clone()), Arc::new(test_clock()))
            .with_retry_policy(RetryPolicy::builder().initial_delay(Duration::from_millis(1)).jitter(false).build());
        Self {
            broker,
            store: InMemoryFeeStore::new(),
            publisher,
        }
    }

    fn processor(&self, handler: impl IdempotentHandler + 'static) -> MessageProcessor {
        MessageProcessor::new(Arc::new(self.store.clone()), Arc::new(handler), Arc::new(test_clock()))
    }

    async fn step(&self, processor: &MessageProcessor) -> Disposition {
        let delivery = self.broker.next_delivery(FEE_ASSIGNMENT_QUEUE).expect("a ready message");
        processor.process(&self.broker, delivery).await.unwrap()
    }
}

#[tokio::test]
async fn redelivered_event_creates_exactly_one_fee() {
    let h = Harness::new(5);
    let processor = h.processor(FeeFromAssignment);

    let event = h.publisher.publish(assignment(7, 3)).await.unwrap();
    // Simulate the broker delivering the same message twice.
    h.publisher.send(&event).await.unwrap();

    assert_eq!(h.step(&processor).await, Disposition::Applied);
    assert_eq!(h.step(&processor).await, Disposition::Deduplicated);

    let fees = h.store.fees();
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0].billing_month.to_string(), "2025-06");
    assert_eq!(fees[0].amount.to_string(), "300.00");
    assert_eq!(h.store.ledger().len(), 1);
}

#[tokio::test]
async fn malformed_body_is_dead_lettered() {
    let h = Harness::new(5);
    let processor = h.processor(FeeFromAssignment);
    h.broker.inject(FEE_ASSIGNMENT_QUEUE, "parking.assigned", b"{not json".to_vec());

    assert_eq!(h.step(&processor).await, Disposition::DeadLettered);

    let dead = h.broker.messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"{not json");
    assert_eq!(dead[0].routing_key, DEAD_LETTER_ROUTING_KEY);
    assert_eq!(dead[0].headers[DEATH_QUEUE_HEADER], FEE_ASSIGNMENT_QUEUE);
    assert_eq!(dead[0].headers[DEATH_REASON_HEADER], "rejected");
    assert!(h.store.fees().is_empty());
}

#[tokio::test]
async fn transient_store_failure_is_requeued_then_applied() {
    let h = Harness::new(5);
    let processor = h.processor(FeeFromAssignment);
    h.publisher.publish(assignment(7, 3)).await.unwrap();

    h.store.fail_next(1);
    assert_eq!(h.step(&processor).await, Disposition::Requeued);
    assert_eq!(h.broker.queue_depth(FEE_ASSIGNMENT_QUEUE), 1);

    assert_eq!(h.step(&processor).await, Disposition::Applied);
    assert_eq!(h.store.fees().len(), 1);
}

#[tokio::test]
async fn persistent_transient_failure_ends_in_dead_letter_queue() {
    let h = Harness::new(5);
    let processor = h.processor(FeeFromAssignment);
    let event = h.publisher.publish(assignment(7, 3)).await.unwrap();
    h.store.fail_next(usize::MAX);

    for _ in 0..5 {
        assert_eq!(h.step(&processor).await, Disposition::Requeued);
    }

    assert_eq!(h.broker.queue_depth(FEE_ASSIGNMENT_QUEUE), 0);
    let dead = h.broker.messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, event.to_body().unwrap());
    assert_eq!(dead[0].routing_key, DEAD_LETTER_ROUTING_KEY);
    assert_eq!(dead[0].headers[DEATH_REASON_HEADER], "delivery-limit");
}

#[tokio::test]
async fn handler_panic_is_dead_lettered() {
    let h = Harness::new(5);
    let processor = h.processor(Exploding);
    let event = h.publisher.publish(assignment(7, 3)).await.unwrap();

    assert_eq!(h.step(&processor).await, Disposition::DeadLettered);
    let dead = h.broker.messages(DEAD_LETTER_QUEUE);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, event.to_body().unwrap());
    assert_eq!(dead[0].routing_key, DEAD_LETTER_ROUTING_KEY);
    assert!(h.store.ledger().is_empty());
}

#[tokio::test]
async fn every_delivery_is_settled_exactly_once() {
    let h = Harness::new(5);
    let processor = h.processor(FeeFromAssignment);
    let event = h.publisher.publish(assignment(7, 3)).await.unwrap();
    h.publisher.send(&event).await.unwrap();

    h.step(&processor).await;
    h.step(&processor).await;

    let settlements = h.broker.settlements();
    assert_eq!(settlements.len(), 2);
    assert!(settlements.iter().all(|(_, id, decision)| *id == event.event_id && *decision == AckDecision::Ack));
}

#[tokio::test]
async fn pool_workers_drain_queue_and_stop_on_shutdown() {
    let h = Harness::new(5);
    let broker: Arc<dyn Broker> = Arc::new(h.broker.clone());
    let (shutdown, _) = broadcast::channel(1);

    let workers = ConsumerPool::new(broker, FEE_ASSIGNMENT_QUEUE, h.processor(FeeFromAssignment))
        .with_workers(3)
        .spawn(&shutdown);

    for user in 1..=20 {
        let event = h.publisher.publish(assignment(user, user)).await.unwrap();
        // Duplicates race with the original across workers.
        h.publisher.send(&event).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.store.ledger().len() < 20
            || h.broker.queue_depth(FEE_ASSIGNMENT_QUEUE) > 0
            || h.broker.unacked(FEE_ASSIGNMENT_QUEUE) > 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue drained");

    shutdown.send(()).unwrap();
    for worker in workers {
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops")
            .unwrap();
    }

    assert_eq!(h.store.fees().len(), 20);
    assert_eq!(h.broker.settlements().len(), 40);
}

#[tokio::test]
async fn pool_resubscribes_after_disconnect() {
    let h = Harness::new(5);
    let broker: Arc<dyn Broker> = Arc::new(h.broker.clone());
    let (shutdown, _) = broadcast::channel(1);
    let workers = ConsumerPool::new(broker, FEE_ASSIGNMENT_QUEUE, h.processor(FeeFromAssignment))
        .with_reconnect_policy(RetryPolicy::builder().initial_delay(Duration::from_millis(5)).jitter(false).build())
        .spawn(&shutdown);

    h.publisher.publish(assignment(1, 1)).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.fees().len() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first fee");

    h.broker.disconnect_consumers();
    h.publisher.publish(assignment(2, 2)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.store.fees().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second fee after reconnect");

    shutdown.send(()).unwrap();
    for worker in workers {
        worker.await.unwrap();
    }
}
