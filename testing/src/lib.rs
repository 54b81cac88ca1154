//! # Parkflow Testing
//!
//! Test doubles for the Parkflow services.
//!
//! This crate provides:
//! - A deterministic clock
//! - [`InMemoryBroker`]: routing, confirms, requeue limits and dead-lettering
//! - In-memory storage adapters with failure injection
//! - [`StubTransport`]: scripted replies for service clients
//!
//! ## Example
//!
//! ```ignore
//! use parkflow_testing::{InMemoryBroker, InMemoryFeeStore, test_clock};
//!
//! #[tokio::test]
//! async fn assignment_creates_one_fee() {
//!     let broker = InMemoryBroker::with_parking_topology(5);
//!     let store = InMemoryFeeStore::new();
//!     // publish AssignmentCreated twice, run the consumer, assert one fee
//! }
//! ```

// Test doubles panic on a poisoned lock; that is a failed test.
#![allow(clippy::unwrap_used)]

use chrono::{DateTime, Utc};
use parkflow_core::environment::Clock;

pub mod broker;
pub mod stores;
pub mod transport;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use parkflow_testing::mocks::FixedClock;
    /// use parkflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock; clones observe the new time.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = time;
        }

        /// Advance the clock by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-06-14 09:30:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-06-14T09:30:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a test tracing subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, QueuedMessage};
pub use mocks::{FixedClock, test_clock};
pub use stores::{InMemoryAssignmentStore, InMemoryFeeStore, InMemoryOutbox, InMemoryOwnerDirectory};
pub use transport::StubTransport;
