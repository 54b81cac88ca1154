//! # Parkflow Runtime
//!
//! Reliability machinery shared by the Parkflow services.
//!
//! ## Core Components
//!
//! - **Publisher**: stamps events once and hands them to the broker, retrying
//!   transient failures; a confirm listener records broker outcomes in the outbox
//! - **Consumers**: the decode → deduplicate → apply → settle pipeline around
//!   an [`consumer::IdempotentHandler`], run by a pool of competing workers
//! - **Service client**: timeout + circuit breaker around calls to other
//!   services, separating business rejections from unavailability
//! - **Reconciliation**: republishes outbox events the broker never confirmed
//! - **Retry / circuit breaker / metrics / health**: the building blocks above
//!
//! ## Example
//!
//! ```ignore
//! use parkflow_runtime::consumer::{ConsumerPool, MessageProcessor};
//!
//! let processor = MessageProcessor::new(ledger, Arc::new(FeeAssignmentHandler::new(fee)), clock);
//! let workers = ConsumerPool::new(broker, FEE_ASSIGNMENT_QUEUE, processor)
//!     .with_workers(4)
//!     .spawn(&shutdown_tx);
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

/// Readiness reports built from dependency checks
pub mod health;

pub mod client;
pub mod directory;
pub mod consumer;
pub mod publisher;
pub mod reconciliation;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use client::{DegradedReason, ServiceClient};
pub use directory::{ParkingDirectoryClient, UserDirectoryClient};
pub use consumer::{ConsumerPool, Disposition, HandlerError, IdempotentHandler, MessageProcessor};
pub use publisher::{ConfirmListener, EventPublisher, PublishError};
pub use reconciliation::ReconciliationSweep;
pub use retry::RetryPolicy;
