//! Redpanda adapter for the [`Broker`] trait.
//!
//! Kafka has topics and consumer groups, not exchanges and queues, so this
//! adapter maps the AMQP model onto them:
//!
//! - every declared **queue** is a topic of the same name, consumed by the
//!   consumer group `{group_prefix}.{queue}`;
//! - **exchanges** exist only in the declared [`Topology`]; a publish is routed
//!   client-side with [`Topology::route`] and produced to each matching queue
//!   topic. A publish that routes nowhere is reported as
//!   [`PublishConfirm::Returned`] followed by [`PublishConfirm::Acked`], as a
//!   mandatory AMQP publish would be;
//! - **settlement** commits the consumer offset. `Requeue` first re-produces
//!   the message to its own topic with `x-delivery-count` incremented, and
//!   `DeadLetter` first produces it to the queue's dead-letter target with the
//!   `x-first-death-*` headers, so a settled message is never lost.
//!
//! # Delivery semantics
//!
//! ```text
//! produce ──▶ queue topic ──▶ StreamConsumer ──▶ Delivery ──▶ settle
//!                  ▲                                             │
//!                  │ Requeue (count + 1)                         ├─ Ack        → commit
//!                  └─────────────────────────────────────────────┤
//!                                                                └─ DeadLetter → DLQ topic, commit
//! ```
//!
//! Offsets are committed only after settlement, so a crash between receive
//! and settle redelivers the message; consumers deduplicate by event id. Each
//! call to [`Broker::consume`] creates its own consumer, and a worker settles
//! a delivery before taking the next, so commits on a partition are in order.
//!
//! # Example
//!
//! ```no_run
//! use parkflow_redpanda::RedpandaBroker;
//! use parkflow_core::broker::Broker;
//! use parkflow_core::topology::Topology;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .partitions(3)
//!     .build()?;
//! broker.declare(&Topology::parking(5)).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use parkflow_core::broker::{
    AckDecision, Broker, BrokerError, BrokerFuture, DEATH_QUEUE_HEADER, DEATH_REASON_HEADER,
    DELIVERY_COUNT_HEADER, Delivery, DeliveryMetadata, DeliveryStream, ORIGINAL_ROUTING_KEY_HEADER,
    OutboundMessage, PublishConfirm,
};
use parkflow_core::topology::Topology;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

const EXCHANGE_HEADER: &str = "x-exchange";
const ROUTING_KEY_HEADER: &str = "x-routing-key";
const MESSAGE_ID_HEADER: &str = "x-message-id";
const CORRELATION_ID_HEADER: &str = "x-correlation-id";
const CONTENT_TYPE_HEADER: &str = "content-type";

/// Properties carried in Kafka headers rather than exposed as application headers.
const TRANSPORT_HEADERS: [&str; 5] = [
    EXCHANGE_HEADER,
    ROUTING_KEY_HEADER,
    MESSAGE_ID_HEADER,
    CORRELATION_ID_HEADER,
    CONTENT_TYPE_HEADER,
];

/// A delivery handed out and not yet settled.
struct Outstanding {
    consumer: Arc<StreamConsumer>,
    partition: i32,
    offset: i64,
    delivery: Delivery,
}

struct Shared {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    topology: Mutex<Topology>,
    outstanding: Mutex<HashMap<(String, u64), Outstanding>>,
    next_tag: AtomicU64,
    confirms: broadcast::Sender<PublishConfirm>,
}

/// Kafka-compatible [`Broker`] backed by rdkafka.
///
/// Cheap to clone; clones share the producer, the declared topology and the
/// table of outstanding deliveries.
#[derive(Clone)]
pub struct RedpandaBroker {
    shared: Arc<Shared>,
    brokers: String,
    group_prefix: String,
    timeout: Duration,
    partitions: i32,
    replication: i32,
    prefetch: usize,
    auto_offset_reset: String,
}

impl RedpandaBroker {
    /// Broker with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unreachable`] if the clients cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Builder for a configured broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group used for `queue`.
    #[must_use]
    pub fn consumer_group(&self, queue: &str) -> String {
        format!("{}.{queue}", self.group_prefix)
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.shared.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outstanding(&self) -> MutexGuard<'_, HashMap<(String, u64), Outstanding>> {
        self.shared.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, confirm: PublishConfirm) {
        // No receivers is fine: confirms are advisory.
        let _ = self.shared.confirms.send(confirm);
    }

    /// Produce `message` to one queue topic and wait for the delivery report.
    async fn produce(&self, topic: &str, message: &OutboundMessage) -> Result<(), String> {
        let message_id = message.message_id.to_string();
        let mut headers = OwnedHeaders::new()
            .insert(Header {
                key: EXCHANGE_HEADER,
                value: Some(message.exchange.as_str()),
            })
            .insert(Header {
                key: ROUTING_KEY_HEADER,
                value: Some(message.routing_key.as_str()),
            })
            .insert(Header {
                key: MESSAGE_ID_HEADER,
                value: Some(message_id.as_str()),
            })
            .insert(Header {
                key: CONTENT_TYPE_HEADER,
                value: Some(message.content_type.as_str()),
            });
        if let Some(correlation_id) = &message.correlation_id {
            headers = headers.insert(Header {
                key: CORRELATION_ID_HEADER,
                value: Some(correlation_id.as_str()),
            });
        }
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(&message_id)
            .payload(&message.body)
            .headers(headers);

        match self.shared.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => {
                tracing::trace!(topic, partition, offset, message_id = %message.message_id, "Produced");
                Ok(())
            }
            Err((error, _)) => Err(error.to_string()),
        }
    }

    /// Produce to every queue the topology routes `message` to.
    ///
    /// Returns how many queues matched.
    async fn route_and_produce(&self, message: &OutboundMessage) -> Result<usize, BrokerError> {
        let targets: Vec<String> = {
            let topology = self.topology();
            if topology.exchange(&message.exchange).is_none() {
                return Err(BrokerError::UnknownExchange(message.exchange.clone()));
            }
            topology
                .route(&message.exchange, &message.routing_key)
                .into_iter()
                .map(str::to_string)
                .collect()
        };

        for topic in &targets {
            self.produce(topic, message).await.map_err(|reason| BrokerError::PublishFailed {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                reason,
            })?;
        }
        Ok(targets.len())
    }

    /// Send `delivery` to its queue's dead-letter target, unchanged apart from
    /// the death headers. `delivery_count` overrides the carried count when set.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        reason: &str,
        delivery_count: Option<u32>,
    ) -> Result<(), BrokerError> {
        let target = self
            .topology()
            .queue(&delivery.queue)
            .and_then(|queue| queue.dead_letter.clone());
        let Some(target) = target else {
            tracing::warn!(
                queue = %delivery.queue,
                message_id = %delivery.message_id,
                "No dead-letter target, dropping message"
            );
            return Ok(());
        };

        let mut message = outbound_from(delivery);
        message
            .headers
            .entry(DEATH_QUEUE_HEADER.to_string())
            .or_insert_with(|| delivery.queue.clone());
        message
            .headers
            .entry(DEATH_REASON_HEADER.to_string())
            .or_insert_with(|| reason.to_string());
        message
            .headers
            .entry(ORIGINAL_ROUTING_KEY_HEADER.to_string())
            .or_insert_with(|| delivery.routing_key.clone());
        if let Some(count) = delivery_count {
            message.headers.insert(DELIVERY_COUNT_HEADER.to_string(), count.to_string());
        }
        message.exchange = target.exchange;
        message.routing_key = target.routing_key;

        self.route_and_produce(&message).await?;
        tracing::error!(
            queue = %delivery.queue,
            message_id = %delivery.message_id,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }

    /// Re-produce `delivery` to its own queue with the delivery count bumped,
    /// or dead-letter it once the queue's limit is reached.
    async fn requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let attempts = delivery.delivery_count() + 1;
        let limit = self
            .topology()
            .queue(&delivery.queue)
            .and_then(|queue| queue.max_delivery_attempts);

        if limit.is_some_and(|limit| attempts >= limit) {
            return self.dead_letter(delivery, "delivery-limit", Some(attempts)).await;
        }

        let mut message = outbound_from(delivery);
        message
            .headers
            .insert(DELIVERY_COUNT_HEADER.to_string(), attempts.to_string());

        self.produce(&delivery.queue, &message)
            .await
            .map_err(|reason| BrokerError::PublishFailed {
                exchange: delivery.exchange.clone(),
                routing_key: delivery.routing_key.clone(),
                reason,
            })
    }

    fn commit(pending: &Outstanding) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&pending.delivery.queue, pending.partition, Offset::Offset(pending.offset + 1))
            .map_err(|e| BrokerError::Unreachable(e.to_string()))?;
        pending
            .consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::Unreachable(e.to_string()))
    }
}

/// Rebuild the publishable form of a received message.
fn outbound_from(delivery: &Delivery) -> OutboundMessage {
    OutboundMessage {
        exchange: delivery.exchange.clone(),
        routing_key: delivery.routing_key.clone(),
        message_id: delivery.message_id,
        correlation_id: delivery.correlation_id.clone(),
        content_type: "application/json".to_string(),
        headers: delivery.headers.clone(),
        body: delivery.body.clone(),
        mandatory: false,
    }
}

/// Convert a Kafka record into a [`Delivery`].
fn to_delivery(message: &BorrowedMessage<'_>, delivery_tag: u64) -> Result<Delivery, BrokerError> {
    let mut transport = HashMap::new();
    let mut headers = BTreeMap::new();
    if let Some(raw) = message.headers() {
        for header in raw.iter() {
            let value = header
                .value
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            if TRANSPORT_HEADERS.contains(&header.key) {
                transport.insert(header.key, value);
            } else {
                headers.insert(header.key.to_string(), value);
            }
        }
    }

    let message_id = transport
        .get(MESSAGE_ID_HEADER)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| BrokerError::Unreachable(format!(
            "record at {}/{}@{} has no message id",
            message.topic(),
            message.partition(),
            message.offset()
        )))?;
    let redelivered = headers.contains_key(DELIVERY_COUNT_HEADER);

    Ok(Delivery {
        metadata: DeliveryMetadata {
            delivery_tag,
            redelivered,
        },
        queue: message.topic().to_string(),
        exchange: transport.remove(EXCHANGE_HEADER).unwrap_or_default(),
        routing_key: transport.remove(ROUTING_KEY_HEADER).unwrap_or_default(),
        message_id,
        correlation_id: transport.remove(CORRELATION_ID_HEADER),
        headers,
        body: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    })
}

impl Broker for RedpandaBroker {
    fn declare<'a>(&'a self, topology: &'a Topology) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let merged = self
                .topology()
                .merged_with(topology)
                .map_err(|e| BrokerError::DeclarationFailed(e.to_string()))?;

            let topics: Vec<NewTopic<'_>> = topology
                .queues
                .iter()
                .map(|queue| NewTopic::new(&queue.name, self.partitions, TopicReplication::Fixed(self.replication)))
                .collect();

            let results = self
                .shared
                .admin
                .create_topics(&topics, &AdminOptions::new().operation_timeout(Some(self.timeout)))
                .await
                .map_err(|e| BrokerError::DeclarationFailed(e.to_string()))?;

            for result in results {
                match result {
                    Ok(topic) => tracing::info!(topic = %topic, "Queue topic created"),
                    Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                        tracing::debug!(topic = %topic, "Queue topic already exists");
                    }
                    Err((topic, code)) => {
                        return Err(BrokerError::DeclarationFailed(format!("topic '{topic}': {code}")));
                    }
                }
            }

            *self.topology() = merged;
            Ok(())
        })
    }

    fn publish(&self, message: OutboundMessage) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let message_id = message.message_id;

            match self.route_and_produce(&message).await {
                Ok(0) => {
                    if message.mandatory {
                        self.emit(PublishConfirm::Returned {
                            message_id,
                            exchange: message.exchange.clone(),
                            routing_key: message.routing_key.clone(),
                            reply_text: "NO_ROUTE".to_string(),
                        });
                    }
                    self.emit(PublishConfirm::Acked { message_id });
                    Ok(())
                }
                Ok(_) => {
                    self.emit(PublishConfirm::Acked { message_id });
                    Ok(())
                }
                Err(BrokerError::PublishFailed { reason, .. }) => {
                    self.emit(PublishConfirm::Nacked { message_id, reason });
                    Ok(())
                }
                Err(other) => Err(other),
            }
        })
    }

    fn confirms(&self) -> broadcast::Receiver<PublishConfirm> {
        self.shared.confirms.subscribe()
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            if self.topology().queue(queue).is_none() {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }

            let group = self.consumer_group(queue);
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BrokerError::Unreachable(format!("Failed to create consumer: {e}")))?;
            consumer
                .subscribe(&[queue])
                .map_err(|e| BrokerError::Unreachable(format!("Failed to subscribe to '{queue}': {e}")))?;
            let consumer = Arc::new(consumer);

            tracing::info!(queue, consumer_group = %group, prefetch = self.prefetch, "Consuming queue");

            let (tx, rx) = tokio::sync::mpsc::channel(self.prefetch);
            let broker = self.clone();
            let queue_name = queue.to_string();

            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();
                while let Some(received) = stream.next().await {
                    let item = match received {
                        Ok(message) => {
                            let tag = broker.shared.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
                            let delivery = to_delivery(&message, tag);
                            if let Ok(delivery) = &delivery {
                                broker.outstanding().insert(
                                    (queue_name.clone(), tag),
                                    Outstanding {
                                        consumer: Arc::clone(&consumer),
                                        partition: message.partition(),
                                        offset: message.offset(),
                                        delivery: delivery.clone(),
                                    },
                                );
                            } else if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                                tracing::warn!(queue = %queue_name, error = %e, "Failed to skip unreadable record");
                            }
                            delivery
                        }
                        Err(e) => Err(BrokerError::Unreachable(format!("Failed to receive message: {e}"))),
                    };

                    if tx.send(item).await.is_err() {
                        tracing::debug!(queue = %queue_name, "Subscriber dropped, stopping consumer");
                        break;
                    }
                }

                // Anything still outstanding is redelivered to the group.
                broker
                    .outstanding()
                    .retain(|(queue, _), pending| queue != &queue_name || !Arc::ptr_eq(&pending.consumer, &consumer));
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn settle<'a>(&'a self, queue: &'a str, delivery_tag: u64, decision: AckDecision) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let pending = self
                .outstanding()
                .remove(&(queue.to_string(), delivery_tag))
                .ok_or_else(|| BrokerError::UnknownDelivery {
                    queue: queue.to_string(),
                    delivery_tag,
                })?;

            let forwarded = match decision {
                AckDecision::Ack => Ok(()),
                AckDecision::Requeue => self.requeue(&pending.delivery).await,
                AckDecision::DeadLetter => self.dead_letter(&pending.delivery, "rejected", None).await,
            };

            if let Err(e) = forwarded {
                // Rewind so this consumer reads the record again.
                if let Err(seek) = pending.consumer.seek(
                    queue,
                    pending.partition,
                    Offset::Offset(pending.offset),
                    Timeout::After(self.timeout),
                ) {
                    tracing::warn!(queue, delivery_tag, error = %seek, "Failed to rewind after settle failure");
                }
                return Err(e);
            }

            Self::commit(&pending)?;
            tracing::debug!(queue, delivery_tag, decision = decision.as_str(), "Delivery settled");
            Ok(())
        })
    }
}

/// Builder for [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    timeout: Option<Duration>,
    group_prefix: Option<String>,
    partitions: Option<i32>,
    replication: Option<i32>,
    prefetch: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Comma-separated bootstrap servers.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Producer acknowledgement mode: `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Produce and admin timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Prefix for per-queue consumer groups.
    ///
    /// Default: `"parkflow"`
    #[must_use]
    pub fn group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = Some(prefix.into());
        self
    }

    /// Partitions for newly created queue topics.
    ///
    /// Default: 3
    #[must_use]
    pub const fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Replication factor for newly created queue topics.
    ///
    /// Default: 1
    #[must_use]
    pub const fn replication(mut self, replication: i32) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Deliveries buffered ahead of the subscriber, minimum 1.
    ///
    /// Default: 1
    #[must_use]
    pub fn prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = Some(prefetch.max(1));
        self
    }

    /// Where a new consumer group starts reading.
    ///
    /// Default: `"earliest"`, so messages produced before the first consumer
    /// started are still delivered.
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Create the producer and admin client.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unreachable`] if brokers are not set or a client
    /// cannot be created.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::Unreachable("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.unwrap_or_else(|| "all".to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", &acks)
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Unreachable(format!("Failed to create producer: {e}")))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .create()
            .map_err(|e| BrokerError::Unreachable(format!("Failed to create admin client: {e}")))?;

        let (confirms, _) = broadcast::channel(1024);
        let broker = RedpandaBroker {
            shared: Arc::new(Shared {
                producer,
                admin,
                topology: Mutex::new(Topology::new()),
                outstanding: Mutex::new(HashMap::new()),
                next_tag: AtomicU64::new(0),
                confirms,
            }),
            brokers,
            group_prefix: self.group_prefix.unwrap_or_else(|| "parkflow".to_string()),
            timeout,
            partitions: self.partitions.unwrap_or(3),
            replication: self.replication.unwrap_or(1),
            prefetch: self.prefetch.unwrap_or(1),
            auto_offset_reset: self.auto_offset_reset.unwrap_or_else(|| "earliest".to_string()),
        };

        tracing::info!(
            brokers = %broker.brokers,
            acks = %acks,
            partitions = broker.partitions,
            group_prefix = %broker.group_prefix,
            "RedpandaBroker created"
        );
        Ok(broker)
    }
}
