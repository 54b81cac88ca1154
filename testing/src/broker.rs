//! In-memory broker with AMQP semantics.
//!
//! [`InMemoryBroker`] implements [`Broker`] for tests and single-process
//! runs: topic and direct routing, mandatory returns, publisher confirms,
//! competing consumers with a prefetch of one, requeue with a delivery limit,
//! and dead-lettering with the `x-first-death-*` headers.
//!
//! Failure injection helpers let tests make the broker refuse or nack
//! publishes and drop consumer connections.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Poisoned locks only occur after a test already panicked

use parkflow_core::broker::{
    AckDecision, Broker, BrokerError, BrokerFuture, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER,
    DELIVERY_COUNT_HEADER, Delivery, DeliveryMetadata, DeliveryStream, ORIGINAL_ROUTING_KEY_HEADER,
    OutboundMessage, PublishConfirm,
};
use parkflow_core::topology::Topology;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// A message sitting in a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Exchange the message was routed through
    pub exchange: String,
    /// Routing key (the dead-letter key once dead-lettered)
    pub routing_key: String,
    /// Broker-level message id
    pub message_id: Uuid,
    /// Correlation id property
    pub correlation_id: Option<String>,
    /// Headers, including delivery count and death headers
    pub headers: BTreeMap<String, String>,
    /// Payload
    pub body: Vec<u8>,
    /// Whether this message was delivered before
    pub redelivered: bool,
}

impl QueuedMessage {
    fn from_outbound(message: &OutboundMessage) -> Self {
        Self {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            message_id: message.message_id,
            correlation_id: message.correlation_id.clone(),
            headers: message.headers.clone(),
            body: message.body.clone(),
            redelivered: false,
        }
    }

    /// Number of requeues recorded in the headers.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    fn into_delivery(self, queue: &str, delivery_tag: u64) -> Delivery {
        Delivery {
            metadata: DeliveryMetadata {
                delivery_tag,
                redelivered: self.redelivered,
            },
            queue: queue.to_string(),
            exchange: self.exchange,
            routing_key: self.routing_key,
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            headers: self.headers,
            body: self.body,
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
    in_flight: Option<u64>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, (QueuedMessage, Option<u64>)>,
    subscribers: Vec<Subscriber>,
    next_subscriber: usize,
}

#[derive(Default)]
struct State {
    topology: Topology,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_subscriber_id: u64,
    fail_publishes: usize,
    nack_publishes: usize,
    published: Vec<OutboundMessage>,
    settlements: Vec<(String, Uuid, AckDecision)>,
}

/// In-memory [`Broker`].
///
/// Cloning is cheap and clones share state.
///
/// # Example
///
/// ```
/// use parkflow_core::broker::Broker;
/// use parkflow_core::topology::Topology;
/// use parkflow_testing::InMemoryBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.declare(&Topology::parking(5)).await?;
/// assert_eq!(broker.queue_depth("parking.dlx.queue"), 0);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    confirms: broadcast::Sender<PublishConfirm>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker").finish_non_exhaustive()
    }
}

impl InMemoryBroker {
    /// Broker with nothing declared.
    #[must_use]
    pub fn new() -> Self {
        let (confirms, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            confirms,
        }
    }

    /// Broker with the parking topology already declared.
    #[must_use]
    pub fn with_parking_topology(max_delivery_attempts: u32) -> Self {
        let broker = Self::new();
        {
            let mut state = broker.lock();
            state.topology = Topology::parking(max_delivery_attempts);
            let names: Vec<String> = state.topology.queues.iter().map(|q| q.name.clone()).collect();
            for name in names {
                state.queues.entry(name).or_default();
            }
        }
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Make the next `count` publishes fail with [`BrokerError::Unreachable`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().fail_publishes = count;
    }

    /// Accept the next `count` publishes but nack them without enqueueing.
    pub fn nack_next_publishes(&self, count: usize) {
        self.lock().nack_publishes = count;
    }

    /// End every consumer's delivery stream; in-flight deliveries go back to their queues.
    pub fn disconnect_consumers(&self) {
        let mut state = self.lock();
        for queue in state.queues.values_mut() {
            queue.subscribers.clear();
            requeue_orphans(queue);
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Messages waiting in `queue` (not counting unacknowledged ones).
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries of `queue` that were handed out and not settled yet.
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the messages waiting in `queue`, oldest first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every message accepted by [`Broker::publish`], in order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.lock().published.clone()
    }

    /// Every settlement as `(queue, message_id, decision)`, in order.
    #[must_use]
    pub fn settlements(&self) -> Vec<(String, Uuid, AckDecision)> {
        self.lock().settlements.clone()
    }

    /// Put a raw message straight into `queue`, bypassing routing.
    pub fn inject(&self, queue: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Uuid {
        let message_id = Uuid::new_v4();
        let mut guard = self.lock();
        let state = &mut *guard;
        let queue_state = state.queues.entry(queue.to_string()).or_default();
        queue_state.ready.push_back(QueuedMessage {
            exchange: String::new(),
            routing_key: routing_key.to_string(),
            message_id,
            correlation_id: None,
            headers: BTreeMap::new(),
            body: body.into(),
            redelivered: false,
        });
        dispatch(queue, queue_state, &mut TagCounter(&mut state.next_tag));
        message_id
    }

    /// Take the next ready message of `queue` as an unsettled delivery,
    /// without a subscriber. Lets tests drive a consumer step by step.
    #[must_use]
    pub fn next_delivery(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.lock();
        state.next_tag += 1;
        let tag = state.next_tag;
        let queue_state = state.queues.get_mut(queue)?;
        let message = queue_state.ready.pop_front()?;
        queue_state.unacked.insert(tag, (message.clone(), None));
        Some(message.into_delivery(queue, tag))
    }

    fn emit(&self, confirm: PublishConfirm) {
        // No receivers is fine: nobody is listening for outcomes.
        let _ = self.confirms.send(confirm);
    }
}

impl State {
    /// Enqueue into every queue bound for the key. Returns how many queues matched.
    fn route_and_enqueue(&mut self, exchange: &str, message: &QueuedMessage) -> usize {
        let targets: Vec<String> = self
            .topology
            .route(exchange, &message.routing_key)
            .into_iter()
            .map(str::to_string)
            .collect();

        for target in &targets {
            let mut tags = TagCounter(&mut self.next_tag);
            let queue = self.queues.entry(target.clone()).or_default();
            queue.ready.push_back(message.clone());
            dispatch(target, queue, &mut tags);
        }
        targets.len()
    }

    fn dead_letter(&mut self, queue: &str, mut message: QueuedMessage, reason: &str) {
        let Some(target) = self.topology.queue(queue).and_then(|q| q.dead_letter.clone()) else {
            tracing::warn!(queue, message_id = %message.message_id, "No dead-letter target, dropping message");
            return;
        };

        message
            .headers
            .entry(DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| queue.to_string());
        message
            .headers
            .entry(DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| reason.to_string());
        message
            .headers
            .entry(ORIGINAL_ROUTING_KEY_HEADER.to_string())
            .or_insert_with(|| message.routing_key.clone());
        message.exchange.clone_from(&target.exchange);
        message.routing_key = target.routing_key;
        message.redelivered = false;

        if self.route_and_enqueue(&target.exchange, &message) == 0 {
            tracing::warn!(queue, message_id = %message.message_id, "Dead-letter target routes nowhere, dropping message");
        }
    }
}

struct TagCounter<'a>(&'a mut u64);

impl TagCounter<'_> {
    fn next(&mut self) -> u64 {
        *self.0 += 1;
        *self.0
    }
}

/// Return in-flight deliveries of vanished subscribers to the head of the queue.
fn requeue_orphans(queue: &mut QueueState) {
    let live: Vec<u64> = queue.subscribers.iter().map(|s| s.id).collect();
    let orphaned: Vec<u64> = queue
        .unacked
        .iter()
        .filter(|(_, (_, owner))| owner.is_some_and(|id| !live.contains(&id)))
        .map(|(tag, _)| *tag)
        .collect();

    for tag in orphaned {
        if let Some((mut message, _)) = queue.unacked.remove(&tag) {
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

/// Hand ready messages to idle subscribers, round robin, one in flight each.
fn dispatch(name: &str, queue: &mut QueueState, tags: &mut TagCounter<'_>) {
    queue.subscribers.retain(|s| !s.sender.is_closed());
    requeue_orphans(queue);

    while !queue.ready.is_empty() && !queue.subscribers.is_empty() {
        let count = queue.subscribers.len();
        let Some(index) = (0..count)
            .map(|offset| (queue.next_subscriber + offset) % count)
            .find(|&i| queue.subscribers[i].in_flight.is_none())
        else {
            return;
        };
        queue.next_subscriber = (index + 1) % count;

        let Some(message) = queue.ready.pop_front() else {
            return;
        };
        let tag = tags.next();
        let subscriber = &mut queue.subscribers[index];

        if subscriber.sender.send(message.clone().into_delivery(name, tag)).is_ok() {
            subscriber.in_flight = Some(tag);
            let owner = subscriber.id;
            queue.unacked.insert(tag, (message, Some(owner)));
        } else {
            queue.subscribers.remove(index);
            queue.ready.push_front(message);
            queue.next_subscriber = 0;
        }
    }
}

impl Broker for InMemoryBroker {
    fn declare<'a>(&'a self, topology: &'a Topology) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            let merged = state
                .topology
                .merged_with(topology)
                .map_err(|e| BrokerError::DeclarationFailed(e.to_string()))?;

            for queue in &merged.queues {
                state.queues.entry(queue.name.clone()).or_default();
            }
            state.topology = merged;
            Ok(())
        })
    }

    fn publish(&self, message: OutboundMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let confirm = {
                let mut state = self.lock();

                if state.fail_publishes > 0 {
                    state.fail_publishes -= 1;
                    return Err(BrokerError::Unreachable("injected publish failure".to_string()));
                }
                if state.topology.exchange(&message.exchange).is_none() {
                    return Err(BrokerError::UnknownExchange(message.exchange.clone()));
                }

                state.published.push(message.clone());

                if state.nack_publishes > 0 {
                    state.nack_publishes -= 1;
                    vec![PublishConfirm::Nacked {
                        message_id: message.message_id,
                        reason: "injected nack".to_string(),
                    }]
                } else {
                    let queued = QueuedMessage::from_outbound(&message);
                    let matched = state.route_and_enqueue(&message.exchange, &queued);
                    let mut confirms = Vec::with_capacity(2);
                    if matched == 0 && message.mandatory {
                        confirms.push(PublishConfirm::Returned {
                            message_id: message.message_id,
                            exchange: message.exchange.clone(),
                            routing_key: message.routing_key.clone(),
                            reply_text: "NO_ROUTE".to_string(),
                        });
                    }
                    confirms.push(PublishConfirm::Acked {
                        message_id: message.message_id,
                    });
                    confirms
                }
            };

            for outcome in confirm {
                self.emit(outcome);
            }
            Ok(())
        })
    }

    fn confirms(&self) -> broadcast::Receiver<PublishConfirm> {
        self.confirms.subscribe()
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            {
                let mut guard = self.lock();
                let state = &mut *guard;
                if state.topology.queue(queue).is_none() {
                    return Err(BrokerError::UnknownQueue(queue.to_string()));
                }
                state.next_subscriber_id += 1;
                let id = state.next_subscriber_id;
                let mut tags = TagCounter(&mut state.next_tag);
                let queue_state = state.queues.entry(queue.to_string()).or_default();
                queue_state.subscribers.push(Subscriber {
                    id,
                    sender,
                    in_flight: None,
                });
                dispatch(queue, queue_state, &mut tags);
            }

            let stream: DeliveryStream = Box::pin(async_stream::stream! {
                while let Some(delivery) = receiver.recv().await {
                    yield Ok(delivery);
                }
            });
            Ok(stream)
        })
    }

    fn settle<'a>(
        &'a self,
        queue: &'a str,
        delivery_tag: u64,
        decision: AckDecision,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut guard = self.lock();
            let state = &mut *guard;

            let unknown = || BrokerError::UnknownDelivery {
                queue: queue.to_string(),
                delivery_tag,
            };
            let queue_state = state.queues.get_mut(queue).ok_or_else(unknown)?;
            let (mut message, owner) = queue_state.unacked.remove(&delivery_tag).ok_or_else(unknown)?;

            if let Some(owner) = owner {
                if let Some(subscriber) = queue_state.subscribers.iter_mut().find(|s| s.id == owner) {
                    subscriber.in_flight = None;
                }
            }

            state
                .settlements
                .push((queue.to_string(), message.message_id, decision));

            let limit = state.topology.queue(queue).and_then(|q| q.max_delivery_attempts);

            match decision {
                AckDecision::Ack => {}
                AckDecision::Requeue => {
                    let count = message.delivery_count() + 1;
                    if limit.is_some_and(|limit| count >= limit) {
                        message.headers.insert(DELIVERY_COUNT_HEADER.to_string(), count.to_string());
                        state.dead_letter(queue, message, "delivery-limit");
                    } else {
                        message.headers.insert(DELIVERY_COUNT_HEADER.to_string(), count.to_string());
                        message.redelivered = true;
                        if let Some(queue_state) = state.queues.get_mut(queue) {
                            queue_state.ready.push_back(message);
                        }
                    }
                }
                AckDecision::DeadLetter => state.dead_letter(queue, message, "rejected"),
            }

            let mut tags = TagCounter(&mut state.next_tag);
            if let Some(queue_state) = state.queues.get_mut(queue) {
                dispatch(queue, queue_state, &mut tags);
            }
            Ok(())
        })
    }
}
