use crate::error::{FerryError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Consumer-side settings for a bus peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Persistent peers replay their backlog on registration.
    pub is_persistent: bool,
    pub environment: Option<String>,
    /// Upper bound on the transport shutdown handshake.
    pub receive_stop_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            is_persistent: true,
            environment: None,
            receive_stop_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    pub fn transient() -> Self {
        Self {
            is_persistent: false,
            ..Self::default()
        }
    }

    /// Load client configuration from environment variables.
    ///
    /// Optional: FERRY_IS_PERSISTENT (true/false, defaults to true)
    /// Optional: FERRY_ENVIRONMENT
    /// Optional: FERRY_RECEIVE_STOP_TIMEOUT_MS
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = env::var("FERRY_IS_PERSISTENT") {
            config.is_persistent = value.parse().map_err(|_| {
                FerryError::Config(format!("Invalid FERRY_IS_PERSISTENT: {}", value))
            })?;
        }

        config.environment = env::var("FERRY_ENVIRONMENT").ok().filter(|e| !e.is_empty());

        if let Ok(value) = env::var("FERRY_RECEIVE_STOP_TIMEOUT_MS") {
            config.receive_stop_timeout_ms = value.parse().map_err(|_| {
                FerryError::Config(format!("Invalid FERRY_RECEIVE_STOP_TIMEOUT_MS: {}", value))
            })?;
        }

        Ok(config)
    }

    pub fn receive_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_stop_timeout_ms)
    }
}
