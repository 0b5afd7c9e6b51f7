//! Records persisted on behalf of the gateway.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Owning account a device is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    /// Short human-shareable identifier typed into a device during provisioning.
    pub short_id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
}

impl Account {
    pub fn new(id: i64, short_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id,
            short_id: short_id.into(),
            email: email.into(),
            name: String::new(),
        }
    }
}

/// Normalized email used as the lookup key.
pub fn email_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// A device (board) known to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(default)]
    pub account_id: Option<i64>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub command_topic: Option<String>,
    #[serde(default)]
    pub response_topic: Option<String>,
    #[serde(default)]
    pub online: bool,
    /// Unix timestamp in milliseconds.
    #[serde(default)]
    pub last_seen: Option<i64>,
    /// Last reported state per pin.
    #[serde(default)]
    pub pin_states: BTreeMap<i64, Value>,
    /// Peripherals attached to the board, as last synced.
    #[serde(default)]
    pub peripherals: Vec<Value>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

/// Announced values for a device; `None` fields carry no information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceUpdate {
    pub account_id: Option<i64>,
    pub mac_address: Option<String>,
    pub display_name: Option<String>,
    pub location: Option<String>,
    pub command_topic: Option<String>,
    pub response_topic: Option<String>,
}

impl DeviceRecord {
    /// New record populated from an announcement.
    pub fn from_update(device_id: impl Into<String>, update: DeviceUpdate, now: i64) -> Self {
        Self {
            device_id: device_id.into(),
            account_id: update.account_id,
            mac_address: update.mac_address,
            display_name: update.display_name,
            location: update.location,
            command_topic: update.command_topic,
            response_topic: update.response_topic,
            created_at: now,
            updated_at: now,
            ..Default::default()
        }
    }

    /// Fill only the fields that are currently empty.
    ///
    /// Existing values win over announced ones, so a stale announcement
    /// cannot clobber accepted configuration. Returns whether anything changed.
    pub fn coalesce(&mut self, update: DeviceUpdate, now: i64) -> bool {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) -> bool {
            if slot.is_none() && value.is_some() {
                *slot = value;
                true
            } else {
                false
            }
        }

        let mut changed = fill(&mut self.account_id, update.account_id);
        changed |= fill(&mut self.mac_address, update.mac_address);
        changed |= fill(&mut self.display_name, update.display_name);
        changed |= fill(&mut self.location, update.location);
        changed |= fill(&mut self.command_topic, update.command_topic);
        changed |= fill(&mut self.response_topic, update.response_topic);
        if changed {
            self.updated_at = now;
        }
        changed
    }

    /// Record device liveness.
    pub fn touch(&mut self, now: i64) {
        self.online = true;
        self.last_seen = Some(now);
        self.updated_at = now;
    }
}

/// Kind of append-only record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Command,
    CommandResult,
    SensorReading,
    StateChange,
    Heartbeat,
    DeviceError,
    Unclassified,
}

/// One append-only record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub device_id: String,
    pub kind: RecordKind,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub data: Value,
}

impl Record {
    pub fn new(device_id: impl Into<String>, kind: RecordKind, data: Value) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn existing() -> DeviceRecord {
        DeviceRecord {
            device_id: "ESP32_1".to_string(),
            account_id: Some(7),
            mac_address: Some("AA:BB:CC:00:11:22".to_string()),
            command_topic: Some("custom/cmd".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_coalesce_preserves_existing_values() {
        let mut record = existing();
        let changed = record.coalesce(
            DeviceUpdate {
                account_id: Some(99),
                mac_address: Some("FF:FF:FF:FF:FF:FF".to_string()),
                command_topic: Some("cmd/ESP32_1".to_string()),
                response_topic: Some("resp/ESP32_1".to_string()),
                ..Default::default()
            },
            1000,
        );

        assert!(changed);
        assert_eq!(record.account_id, Some(7));
        assert_eq!(record.mac_address.as_deref(), Some("AA:BB:CC:00:11:22"));
        assert_eq!(record.command_topic.as_deref(), Some("custom/cmd"));
        assert_eq!(record.response_topic.as_deref(), Some("resp/ESP32_1"));
        assert_eq!(record.updated_at, 1000);
    }

    #[test]
    fn test_coalesce_without_new_information() {
        let mut record = existing();
        let changed = record.coalesce(DeviceUpdate::default(), 1000);
        assert!(!changed);
        assert_eq!(record.updated_at, 0);
    }

    #[test]
    fn test_email_key_normalization() {
        assert_eq!(email_key("  Owner@Example.COM "), "owner@example.com");
    }

    #[test]
    fn test_record_kind_serialization() {
        let record = Record::new("board1", RecordKind::SensorReading, json!({"t": 21.5}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "sensor_reading");
    }
}
