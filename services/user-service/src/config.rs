//! Configuration for the user service.

use parkflow_web::config::{ConfigError, DatabaseConfig, ServerConfig};
use serde::{Deserialize, Serialize};

/// User service configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Owner database
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env(8081)?,
            database: DatabaseConfig::from_env("parkflow_users")?,
        })
    }
}
