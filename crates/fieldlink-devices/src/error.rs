//! Error types for the device protocol engine.

use fieldlink_core::{ConnectionState, Error as CoreError};
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failures surfaced to callers of the gateway.
///
/// Timeouts are not errors: `wait_for_ack` reports them as `false`.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Publish or subscribe attempted while the broker connection is down.
    #[error("Not connected to broker (state: {0})")]
    NotConnected(ConnectionState),

    /// The MQTT client refused or lost the request.
    #[error("MQTT client error: {0}")]
    Client(String),

    #[error("Subscription rejected by broker: {0}")]
    SubscriptionRejected(String),

    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<fieldlink_storage::Error> for GatewayError {
    fn from(e: fieldlink_storage::Error) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<rumqttc::ClientError> for GatewayError {
    fn from(e: rumqttc::ClientError) -> Self {
        GatewayError::Client(e.to_string())
    }
}

impl From<GatewayError> for CoreError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Serialization(s) => CoreError::Serialization(s),
            GatewayError::Storage(s) => CoreError::Storage(s),
            GatewayError::InvalidPattern(s) => CoreError::Validation(s),
            other => CoreError::Transport(other.to_string()),
        }
    }
}

/// Why a device could not be bound to an account.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Registration is missing deviceId")]
    MissingDeviceId,

    #[error("Registration for {0} is missing shortId")]
    MissingShortId(String),

    #[error("No account matches the registration for {device_id}")]
    NoAccount { device_id: String },

    #[error("Storage error during registration: {0}")]
    Storage(String),
}

impl From<fieldlink_storage::Error> for RegistrationError {
    fn from(e: fieldlink_storage::Error) -> Self {
        RegistrationError::Storage(e.to_string())
    }
}
