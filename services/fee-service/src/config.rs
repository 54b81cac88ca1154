//! Configuration for the fee service.

use parkflow_core::model::Money;
use parkflow_runtime::CircuitBreakerConfig;
use parkflow_web::config::{ConfigError, DatabaseConfig, MessagingConfig, ServerConfig, string_or, var_or};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Downstream services the payment flow calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Base URL of user-service
    pub user_service_url: String,
    /// Base URL of parking-service
    pub parking_service_url: String,
    /// Per-call timeout in milliseconds
    pub timeout_ms: u64,
    /// Failures inside the window that open a breaker
    pub breaker_failure_threshold: usize,
    /// Breaker failure window in seconds
    pub breaker_window_secs: u64,
    /// Seconds a breaker stays open
    pub breaker_cooldown_secs: u64,
}

impl DownstreamConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            user_service_url: string_or("USER_SERVICE_URL", "http://localhost:8081"),
            parking_service_url: string_or("PARKING_SERVICE_URL", "http://localhost:8082"),
            timeout_ms: var_or("DOWNSTREAM_TIMEOUT_MS", 2_000)?,
            breaker_failure_threshold: var_or("BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_window_secs: var_or("BREAKER_WINDOW_SECS", 30)?,
            breaker_cooldown_secs: var_or("BREAKER_COOLDOWN_SECS", 10)?,
        })
    }

    /// Per-call timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Breaker settings shared by both downstream clients.
    #[must_use]
    pub const fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::builder()
            .failure_threshold(self.breaker_failure_threshold)
            .window(Duration::from_secs(self.breaker_window_secs))
            .cooldown(Duration::from_secs(self.breaker_cooldown_secs))
            .build()
    }
}

/// Fee service configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Fee database
    pub database: DatabaseConfig,
    /// Broker, consumers and outbox
    pub messaging: MessagingConfig,
    /// user-service and parking-service
    pub downstream: DownstreamConfig,
    /// Amount of each issued monthly fee
    pub monthly_fee: Money,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env(8083)?,
            database: DatabaseConfig::from_env("parkflow_fees")?,
            messaging: MessagingConfig::from_env()?,
            downstream: DownstreamConfig::from_env()?,
            monthly_fee: var_or("MONTHLY_FEE", Money::from_cents(30_000))?,
        })
    }
}
