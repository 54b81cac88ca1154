//! Owner directory service.
//!
//! Serves `GET /user/owners/{userId}` in the `{code, message, data}` envelope.
//! A missing owner is a business rejection (`code: 404`), which callers keep
//! apart from "user service unavailable".

pub mod api;
pub mod config;

pub use api::{AppState, router};
pub use config::Config;
