//! Exchange, queue and binding declarations.
//!
//! Routing and failure handling are structural: which queue receives an event,
//! and where a rejected message goes, is decided here rather than in consumer
//! code. [`Topology::validate`] runs before anything is declared so a binding
//! to a missing exchange or a dead-letter target that routes nowhere is a
//! startup error instead of a silently dropped event.
//!
//! # The parking topology
//!
//! ```text
//!                         parking.exchange (topic, durable)
//!                 ┌──────────────┴──────────────┐
//!     "parking.assigned"                    "fee.paid"
//!                 ▼                             ▼
//!   fee.parking.assigned.queue      notification.fee.paid.queue
//!                 │  dead-letter                │  dead-letter
//!                 └──────────────┬──────────────┘
//!                                ▼
//!                 parking.dlx.exchange (direct) ── "dlx" ──▶ parking.dlx.queue
//! ```
//!
//! Both primary queues share one dead-letter queue; each dead-lettered message
//! carries `x-first-death-queue` naming the queue that rejected it.

use crate::event::{FEE_PAID_KEY, PARKING_ASSIGNED_KEY};
use std::collections::HashSet;
use thiserror::Error;

/// Topic exchange receiving every domain event.
pub const PARKING_EXCHANGE: &str = "parking.exchange";

/// Direct exchange receiving rejected and exhausted messages.
pub const DEAD_LETTER_EXCHANGE: &str = "parking.dlx.exchange";

/// Fixed routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY: &str = "dlx";

/// Queue holding dead-lettered messages for operator inspection.
pub const DEAD_LETTER_QUEUE: &str = "parking.dlx.queue";

/// Queue of `AssignmentCreated` events for fee creation.
pub const FEE_ASSIGNMENT_QUEUE: &str = "fee.parking.assigned.queue";

/// Queue of `FeePaid` events for owner notification.
pub const NOTIFICATION_QUEUE: &str = "notification.fee.paid.queue";

/// Deliveries allowed per message before it is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Topology validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// Exchange declared twice
    #[error("Exchange '{0}' declared more than once")]
    DuplicateExchange(String),

    /// Queue declared twice
    #[error("Queue '{0}' declared more than once")]
    DuplicateQueue(String),

    /// Binding or dead-letter target names an undeclared exchange
    #[error("Exchange '{0}' is referenced but not declared")]
    UnknownExchange(String),

    /// Binding names an undeclared queue
    #[error("Queue '{0}' is referenced but not declared")]
    UnknownQueue(String),

    /// Dead-letter target matches no binding
    #[error("Dead-letter target of queue '{queue}' ({exchange}/{routing_key}) routes to no queue")]
    DeadLetterUnroutable {
        /// Primary queue
        queue: String,
        /// Dead-letter exchange
        exchange: String,
        /// Dead-letter routing key
        routing_key: String,
    },

    /// Empty or malformed routing pattern
    #[error("Invalid binding pattern '{0}'")]
    InvalidPattern(String),

    /// Delivery limit of zero would dead-letter every message
    #[error("Queue '{0}' has a delivery limit of zero")]
    ZeroDeliveryLimit(String),

    /// Exchange redeclared with a different kind
    #[error("Exchange '{name}' already declared as {existing}")]
    ConflictingExchange {
        /// Exchange name
        name: String,
        /// Kind it was first declared with
        existing: &'static str,
    },
}

/// Exchange routing behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Dot-separated keys matched against `*`/`#` patterns
    Topic,
    /// Exact key match
    Direct,
}

impl ExchangeKind {
    /// AMQP type literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
        }
    }
}

/// An exchange declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    /// Exchange name
    pub name: String,
    /// Routing behaviour
    pub kind: ExchangeKind,
    /// Survives broker restart
    pub durable: bool,
}

/// Where a queue sends messages it gives up on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// Dead-letter exchange
    pub exchange: String,
    /// Routing key used on the dead-letter exchange
    pub routing_key: String,
}

/// A queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name
    pub name: String,
    /// Survives broker restart
    pub durable: bool,
    /// Dead-letter routing for rejected or exhausted messages
    pub dead_letter: Option<DeadLetterTarget>,
    /// Deliveries allowed before the broker dead-letters the message
    pub max_delivery_attempts: Option<u32>,
}

impl QueueSpec {
    /// Durable queue without dead-lettering.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
            max_delivery_attempts: None,
        }
    }

    /// Route messages this queue gives up on to `exchange` with `routing_key`.
    #[must_use]
    pub fn dead_letter_to(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }

    /// Dead-letter a message once it has been delivered `attempts` times.
    #[must_use]
    pub const fn max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = Some(attempts);
        self
    }
}

/// Binds a queue to an exchange with a routing pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingSpec {
    /// Source exchange
    pub exchange: String,
    /// Destination queue
    pub queue: String,
    /// Routing key (direct) or pattern (topic)
    pub pattern: String,
}

/// A complete set of declarations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    /// Exchanges
    pub exchanges: Vec<ExchangeSpec>,
    /// Queues
    pub queues: Vec<QueueSpec>,
    /// Bindings
    pub bindings: Vec<BindingSpec>,
}

impl Topology {
    /// Empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a durable exchange.
    #[must_use]
    pub fn with_exchange(mut self, name: impl Into<String>, kind: ExchangeKind) -> Self {
        self.exchanges.push(ExchangeSpec {
            name: name.into(),
            kind,
            durable: true,
        });
        self
    }

    /// Add a queue.
    #[must_use]
    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    /// Bind `queue` to `exchange` on `pattern`.
    #[must_use]
    pub fn with_binding(
        mut self,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingSpec {
            exchange: exchange.into(),
            queue: queue.into(),
            pattern: pattern.into(),
        });
        self
    }

    /// The topology of the parking-fee workflow.
    ///
    /// `max_delivery_attempts` bounds how often a transiently failing message
    /// is redelivered before it is dead-lettered.
    #[must_use]
    pub fn parking(max_delivery_attempts: u32) -> Self {
        let primary = |name: &str| {
            QueueSpec::durable(name)
                .dead_letter_to(DEAD_LETTER_EXCHANGE, DEAD_LETTER_ROUTING_KEY)
                .max_delivery_attempts(max_delivery_attempts)
        };

        Self::new()
            .with_exchange(PARKING_EXCHANGE, ExchangeKind::Topic)
            .with_exchange(DEAD_LETTER_EXCHANGE, ExchangeKind::Direct)
            .with_queue(primary(FEE_ASSIGNMENT_QUEUE))
            .with_queue(primary(NOTIFICATION_QUEUE))
            .with_queue(QueueSpec::durable(DEAD_LETTER_QUEUE))
            .with_binding(PARKING_EXCHANGE, FEE_ASSIGNMENT_QUEUE, PARKING_ASSIGNED_KEY)
            .with_binding(PARKING_EXCHANGE, NOTIFICATION_QUEUE, FEE_PAID_KEY)
            .with_binding(DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE, DEAD_LETTER_ROUTING_KEY)
    }

    /// Look up an exchange by name.
    #[must_use]
    pub fn exchange(&self, name: &str) -> Option<&ExchangeSpec> {
        self.exchanges.iter().find(|exchange| exchange.name == name)
    }

    /// Look up a queue by name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|queue| queue.name == name)
    }

    /// Queues a message published to `exchange` with `routing_key` lands in.
    ///
    /// Each queue appears at most once even if several bindings match.
    #[must_use]
    pub fn route(&self, exchange: &str, routing_key: &str) -> Vec<&str> {
        let Some(spec) = self.exchange(exchange) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|binding| binding.exchange == exchange)
            .filter(|binding| match spec.kind {
                ExchangeKind::Topic => topic_matches(&binding.pattern, routing_key),
                ExchangeKind::Direct => binding.pattern == routing_key,
            })
            .map(|binding| binding.queue.as_str())
            .filter(|queue| seen.insert(*queue))
            .collect()
    }

    /// Union of `self` and `other`, validated.
    ///
    /// Declarations already present are kept as they are, so redeclaring the
    /// same topology is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ConflictingExchange`] if `other` redeclares an
    /// exchange with a different kind, or any error from [`Topology::validate`]
    /// on the union.
    pub fn merged_with(&self, other: &Self) -> Result<Self, TopologyError> {
        let mut merged = self.clone();

        for exchange in &other.exchanges {
            match merged.exchange(&exchange.name) {
                Some(existing) if existing.kind != exchange.kind => {
                    return Err(TopologyError::ConflictingExchange {
                        name: exchange.name.clone(),
                        existing: existing.kind.as_str(),
                    });
                }
                Some(_) => {}
                None => merged.exchanges.push(exchange.clone()),
            }
        }
        for queue in &other.queues {
            if merged.queue(&queue.name).is_none() {
                merged.queues.push(queue.clone());
            }
        }
        for binding in &other.bindings {
            if !merged.bindings.contains(binding) {
                merged.bindings.push(binding.clone());
            }
        }

        merged.validate()?;
        Ok(merged)
    }

    /// Check that every reference resolves and every dead-letter target routes somewhere.
    ///
    /// # Errors
    ///
    /// Returns the first [`TopologyError`] found.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut exchanges = HashSet::new();
        for exchange in &self.exchanges {
            if !exchanges.insert(exchange.name.as_str()) {
                return Err(TopologyError::DuplicateExchange(exchange.name.clone()));
            }
        }

        let mut queues = HashSet::new();
        for queue in &self.queues {
            if !queues.insert(queue.name.as_str()) {
                return Err(TopologyError::DuplicateQueue(queue.name.clone()));
            }
            if queue.max_delivery_attempts == Some(0) {
                return Err(TopologyError::ZeroDeliveryLimit(queue.name.clone()));
            }
        }

        for binding in &self.bindings {
            if !exchanges.contains(binding.exchange.as_str()) {
                return Err(TopologyError::UnknownExchange(binding.exchange.clone()));
            }
            if !queues.contains(binding.queue.as_str()) {
                return Err(TopologyError::UnknownQueue(binding.queue.clone()));
            }
            if !is_valid_pattern(&binding.pattern) {
                return Err(TopologyError::InvalidPattern(binding.pattern.clone()));
            }
        }

        for queue in &self.queues {
            let Some(target) = &queue.dead_letter else {
                continue;
            };
            if !exchanges.contains(target.exchange.as_str()) {
                return Err(TopologyError::UnknownExchange(target.exchange.clone()));
            }
            if self.route(&target.exchange, &target.routing_key).is_empty() {
                return Err(TopologyError::DeadLetterUnroutable {
                    queue: queue.name.clone(),
                    exchange: target.exchange.clone(),
                    routing_key: target.routing_key.clone(),
                });
            }
        }

        Ok(())
    }
}

fn is_valid_pattern(pattern: &str) -> bool {
    !pattern.is_empty() && pattern.split('.').all(|word| !word.is_empty())
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
///
/// ```
/// use parkflow_core::topology::topic_matches;
///
/// assert!(topic_matches("parking.*", "parking.assigned"));
/// assert!(topic_matches("#", "fee.paid"));
/// assert!(!topic_matches("fee.*", "fee.paid.late"));
/// ```
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| matches_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parking_topology_is_valid() {
        Topology::parking(DEFAULT_MAX_DELIVERY_ATTEMPTS).validate().unwrap();
    }

    #[test]
    fn parking_topology_routes_each_key_to_one_queue() {
        let topology = Topology::parking(5);
        assert_eq!(topology.route(PARKING_EXCHANGE, "parking.assigned"), vec![FEE_ASSIGNMENT_QUEUE]);
        assert_eq!(topology.route(PARKING_EXCHANGE, "fee.paid"), vec![NOTIFICATION_QUEUE]);
        assert!(topology.route(PARKING_EXCHANGE, "fee.refunded").is_empty());
        assert_eq!(topology.route(DEAD_LETTER_EXCHANGE, "dlx"), vec![DEAD_LETTER_QUEUE]);
    }

    #[test]
    fn merging_is_idempotent_and_rejects_kind_changes() {
        let parking = Topology::parking(DEFAULT_MAX_DELIVERY_ATTEMPTS);
        assert_eq!(parking.merged_with(&parking), Ok(parking.clone()));

        let conflicting = Topology::new().with_exchange(PARKING_EXCHANGE, ExchangeKind::Direct);
        assert!(matches!(
            parking.merged_with(&conflicting),
            Err(TopologyError::ConflictingExchange { .. })
        ));
    }

    #[test]
    fn primary_queues_dead_letter_to_dlx() {
        let topology = Topology::parking(5);
        for name in [FEE_ASSIGNMENT_QUEUE, NOTIFICATION_QUEUE] {
            let queue = topology.queue(name).unwrap();
            let target = queue.dead_letter.as_ref().unwrap();
            assert_eq!(target.exchange, DEAD_LETTER_EXCHANGE);
            assert_eq!(target.routing_key, "dlx");
            assert_eq!(queue.max_delivery_attempts, Some(5));
            assert!(queue.durable);
        }
    }

    #[test]
    fn binding_to_undeclared_exchange_is_rejected() {
        let topology = Topology::new()
            .with_queue(QueueSpec::durable("q"))
            .with_binding("missing", "q", "a.b");
        assert_eq!(topology.validate(), Err(TopologyError::UnknownExchange("missing".into())));
    }

    #[test]
    fn unroutable_dead_letter_target_is_rejected() {
        let topology = Topology::new()
            .with_exchange("main", ExchangeKind::Topic)
            .with_exchange("dlx", ExchangeKind::Direct)
            .with_queue(QueueSpec::durable("q").dead_letter_to("dlx", "dlx"))
            .with_binding("main", "q", "a.#");
        assert!(matches!(
            topology.validate(),
            Err(TopologyError::DeadLetterUnroutable { .. })
        ));
    }

    #[test]
    fn zero_delivery_limit_is_rejected() {
        let topology = Topology::new().with_queue(QueueSpec::durable("q").max_delivery_attempts(0));
        assert_eq!(topology.validate(), Err(TopologyError::ZeroDeliveryLimit("q".into())));
    }

    #[test]
    fn duplicate_bindings_route_once() {
        let topology = Topology::new()
            .with_exchange("main", ExchangeKind::Topic)
            .with_queue(QueueSpec::durable("q"))
            .with_binding("main", "q", "fee.*")
            .with_binding("main", "q", "#");
        assert_eq!(topology.route("main", "fee.paid"), vec!["q"]);
    }

    #[test]
    fn wildcard_semantics() {
        assert!(topic_matches("fee.#", "fee"));
        assert!(topic_matches("fee.#", "fee.paid.late"));
        assert!(topic_matches("*.paid", "fee.paid"));
        assert!(!topic_matches("*.paid", "paid"));
        assert!(topic_matches("#.paid", "fee.paid"));
        assert!(!topic_matches("fee.paid", "fee.paid.late"));
    }

    proptest! {
        #[test]
        fn literal_pattern_matches_itself(words in prop::collection::vec("[a-z]{1,8}", 1..5)) {
            let key = words.join(".");
            prop_assert!(topic_matches(&key, &key));
            prop_assert!(topic_matches("#", &key));
        }

        #[test]
        fn star_replaces_exactly_one_word(
            words in prop::collection::vec("[a-z]{1,8}", 1..5),
            position in 0usize..5,
        ) {
            let position = position % words.len();
            let key = words.join(".");
            let mut pattern = words.clone();
            pattern[position] = "*".to_string();
            prop_assert!(topic_matches(&pattern.join("."), &key));
            let longer = format!("{key}.extra");
            prop_assert!(!topic_matches(&pattern.join("."), &longer));
        }
    }
}
