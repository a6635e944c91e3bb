use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{validate_connection_string, ConnectionOptions};
use crate::dispatcher::{SendOptions, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MS, MAX_PENDING_COMMANDS};
use crate::estop::EmergencyStopConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("malformed config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_pending: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_pending: MAX_PENDING_COMMANDS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl DispatcherConfig {
    pub fn send_options(&self) -> SendOptions {
        SendOptions::new(self.timeout_ms, self.max_retries)
    }
}

/// Everything needed to stand up a [`crate::link::VehicleLink`].
///
/// Every section and field is optional in JSON; missing values take defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub connection: ConnectionOptions,
    pub dispatcher: DispatcherConfig,
    pub emergency_stop: EmergencyStopConfig,
}

impl LinkConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.max_pending == 0 {
            return Err(ConfigError::Invalid("dispatcher.max_pending must be at least 1".into()));
        }
        if self.dispatcher.timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatcher.timeout_ms must be positive".into()));
        }

        let estop = &self.emergency_stop;
        if estop.channel_count == 0 {
            return Err(ConfigError::Invalid(
                "emergency_stop.channel_count must be at least 1".into(),
            ));
        }
        if estop.reset_code.is_empty() {
            return Err(ConfigError::Invalid("emergency_stop.reset_code must not be empty".into()));
        }

        if let Some(conn) = self.connection.connection_string.as_deref() {
            if !validate_connection_string(conn) {
                return Err(ConfigError::Invalid(format!("connection string '{conn}'")));
            }
        }
        if self.connection.event_prefix.is_empty() {
            return Err(ConfigError::Invalid("connection.event_prefix must not be empty".into()));
        }

        Ok(())
    }
}
