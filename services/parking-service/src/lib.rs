//! Parking space assignment service.
//!
//! Owns the `owner_parking` table. Assigning a space validates the owner
//! against user-service, inserts the assignment and its `AssignmentCreated`
//! outbox row in one transaction, then publishes the event; fee-service
//! issues the month's fee from it.
//!
//! Also serves `GET /parking/owner/record?userId=`, the active-assignment
//! lookup the fee payment flow depends on.

pub mod api;
pub mod app;
pub mod assignment;
pub mod config;

pub use api::{AppState, router};
pub use assignment::{AssignmentError, AssignmentService};
pub use config::Config;
