//! Handlers shared by every service.

pub mod health;

pub use health::{OpsState, ReadinessProbe, ops_router};
