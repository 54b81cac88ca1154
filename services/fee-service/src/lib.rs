//! Monthly parking fee service.
//!
//! - consumes `parking.assigned` and issues the month's fee
//! - consumes `fee.paid` and records the owner's payment notice
//! - pays fees after validating the payer against user-service and the
//!   payer's active assignment against parking-service, then publishes
//!   `FeePaid`
//!
//! Consumption is idempotent per `(eventId, consumer)` through the
//! processing ledger; publishing goes through the outbox.

pub mod api;
pub mod app;
pub mod config;
pub mod consumers;
pub mod orchestrator;

pub use api::{AppState, router};
pub use config::Config;
pub use consumers::{FeeIssuer, PaymentNotifier};
pub use orchestrator::{FeePaymentOrchestrator, PaidFee, PaymentError};
