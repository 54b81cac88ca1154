//! Configuration for the parking service.

use parkflow_web::config::{ConfigError, DatabaseConfig, MessagingConfig, ServerConfig, string_or, var_or};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parking service configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Assignment database
    pub database: DatabaseConfig,
    /// Broker and outbox
    pub messaging: MessagingConfig,
    /// Base URL of user-service
    pub user_service_url: String,
    /// Per-call timeout for user-service, in milliseconds
    pub downstream_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env(8082)?,
            database: DatabaseConfig::from_env("parkflow_parking")?,
            messaging: MessagingConfig::from_env()?,
            user_service_url: string_or("USER_SERVICE_URL", "http://localhost:8081"),
            downstream_timeout_ms: var_or("DOWNSTREAM_TIMEOUT_MS", 2_000)?,
        })
    }

    /// Downstream timeout as a [`Duration`].
    #[must_use]
    pub const fn downstream_timeout(&self) -> Duration {
        Duration::from_millis(self.downstream_timeout_ms)
    }
}
