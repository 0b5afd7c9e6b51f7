//! Events the gateway hands to the real-time fan-out layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection lifecycle of the single broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Offline,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Offline => "offline",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal or in-flight status of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Failed,
    TimedOut,
}

impl CommandStatus {
    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
            CommandStatus::TimedOut => "timed_out",
        }
    }
}

/// Gateway event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    ConnectionChanged {
        state: ConnectionState,
    },
    CommandSent {
        command_id: String,
        device_id: String,
        kind: String,
    },
    CommandResolved {
        command_id: String,
        device_id: String,
        status: CommandStatus,
    },
    DeviceRegistered {
        device_id: String,
        account_id: i64,
        created: bool,
    },
    DeviceStateChanged {
        device_id: String,
        pin: Option<i64>,
        state: Value,
    },
    DeviceHeartbeat {
        device_id: String,
        payload: Value,
    },
    SensorReading {
        device_id: String,
        payload: Value,
    },
    DeviceConfigSynced {
        device_id: String,
        devices: Value,
    },
    DeviceError {
        device_id: String,
        message: String,
    },
    Unclassified {
        device_id: String,
        payload: Value,
    },
}

impl GatewayEvent {
    /// Variant name, used for logging and filtering.
    pub fn type_name(&self) -> &'static str {
        match self {
            GatewayEvent::ConnectionChanged { .. } => "ConnectionChanged",
            GatewayEvent::CommandSent { .. } => "CommandSent",
            GatewayEvent::CommandResolved { .. } => "CommandResolved",
            GatewayEvent::DeviceRegistered { .. } => "DeviceRegistered",
            GatewayEvent::DeviceStateChanged { .. } => "DeviceStateChanged",
            GatewayEvent::DeviceHeartbeat { .. } => "DeviceHeartbeat",
            GatewayEvent::SensorReading { .. } => "SensorReading",
            GatewayEvent::DeviceConfigSynced { .. } => "DeviceConfigSynced",
            GatewayEvent::DeviceError { .. } => "DeviceError",
            GatewayEvent::Unclassified { .. } => "Unclassified",
        }
    }

    /// Device the event concerns, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            GatewayEvent::ConnectionChanged { .. } => None,
            GatewayEvent::CommandSent { device_id, .. }
            | GatewayEvent::CommandResolved { device_id, .. }
            | GatewayEvent::DeviceRegistered { device_id, .. }
            | GatewayEvent::DeviceStateChanged { device_id, .. }
            | GatewayEvent::DeviceHeartbeat { device_id, .. }
            | GatewayEvent::SensorReading { device_id, .. }
            | GatewayEvent::DeviceConfigSynced { device_id, .. }
            | GatewayEvent::DeviceError { device_id, .. }
            | GatewayEvent::Unclassified { device_id, .. } => Some(device_id),
        }
    }

    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            GatewayEvent::CommandSent { .. } | GatewayEvent::CommandResolved { .. }
        )
    }

    pub fn is_device_event(&self) -> bool {
        !self.is_command_event() && !matches!(self, GatewayEvent::ConnectionChanged { .. })
    }

    pub fn is_connection_event(&self) -> bool {
        matches!(self, GatewayEvent::ConnectionChanged { .. })
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventMetadata {
    pub event_id: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(CommandStatus::Acknowledged.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::TimedOut.is_terminal());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = GatewayEvent::DeviceStateChanged {
            device_id: "board1".to_string(),
            pin: Some(2),
            state: json!("on"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "device_state_changed");
        assert_eq!(value["device_id"], "board1");
        assert_eq!(event.device_id(), Some("board1"));
    }

    #[test]
    fn test_event_categories() {
        let sent = GatewayEvent::CommandSent {
            command_id: "c1".to_string(),
            device_id: "board1".to_string(),
            kind: "gpio".to_string(),
        };
        assert!(sent.is_command_event());
        assert!(!sent.is_device_event());

        let conn = GatewayEvent::ConnectionChanged {
            state: ConnectionState::Offline,
        };
        assert!(conn.is_connection_event());
        assert_eq!(conn.device_id(), None);
    }
}
