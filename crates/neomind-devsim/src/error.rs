//! Error types for the device simulator.

use thiserror::Error;

/// Result type for simulator operations.
pub type Result<T> = std::result::Result<T, DevSimError>;

/// Errors that can occur while simulating a device.
///
/// None of these escape a running device: the engine turns every one of them
/// into a log line, an error stat, or a controlled stop.
#[derive(Debug, Error)]
pub enum DevSimError {
    /// Invalid simulation or device configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed IoT Hub connection string.
    #[error("Invalid connection string: {0}")]
    ConnectionString(String),

    /// A reconfiguration tried to swap the connection string of an attached device.
    #[error("Connection string has changed for device {0}")]
    ConnectionStringChanged(String),

    /// Hub transport failure (open, send, twin, close).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Device provisioning failure.
    ///
    /// `registration_state` carries the structured error message reported by
    /// the provisioning service when one was available.
    #[error("Provisioning error: {}", registration_state.as_deref().unwrap_or(message))]
    Provisioning {
        message: String,
        registration_state: Option<String>,
    },

    /// Registry (module identity) failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Mock sensor function endpoint failure.
    #[error("Function error: {0}")]
    Function(String),

    /// Edge host environment is missing or does not match.
    #[error("Environment error: {0}")]
    Environment(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The device task is no longer running.
    #[error("Device is stopped")]
    Stopped,

    /// Other error.
    #[error("Simulator error: {0}")]
    Other(#[from] anyhow::Error),
}

impl DevSimError {
    /// Build a provisioning error without a registration-state message.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
            registration_state: None,
        }
    }
}
