//! Firmware wire shapes for logical command kinds.
//!
//! Callers speak in generic envelopes (`{id, type, data, timestamp}`), but
//! firmware generations expect their own action strings and field names.
//! A [`CommandTranslator`] per kind bridges the two and tells the
//! dispatcher which `action`/`pin` an older device will echo back.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope built for every outbound command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

/// What actually goes on the wire, plus what the heuristic matcher should expect.
#[derive(Debug, Clone, PartialEq)]
pub struct WireCommand {
    pub payload: Value,
    pub expected_action: Option<String>,
    pub expected_pin: Option<i64>,
}

pub trait CommandTranslator: Send + Sync {
    fn translate(&self, envelope: &CommandEnvelope) -> WireCommand;
}

/// Pin number from a command's data, accepting numeric strings.
pub fn pin_of(data: &Value) -> Option<i64> {
    match data.get("pin")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `{id, action, ...fields}` translator.
///
/// Each wire field lists the data keys it may be taken from, first present wins.
pub struct ActionTranslator {
    action: String,
    fields: Vec<(String, Vec<String>)>,
}

impl ActionTranslator {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, wire_name: &str, sources: &[&str]) -> Self {
        self.fields.push((
            wire_name.to_string(),
            sources.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }
}

impl CommandTranslator for ActionTranslator {
    fn translate(&self, envelope: &CommandEnvelope) -> WireCommand {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(envelope.id.clone()));
        body.insert("action".to_string(), Value::String(self.action.clone()));

        for (wire_name, sources) in &self.fields {
            let value = sources.iter().find_map(|key| envelope.data.get(key.as_str()));
            if let Some(value) = value {
                body.insert(wire_name.clone(), value.clone());
            }
        }

        WireCommand {
            expected_pin: pin_of(&Value::Object(body.clone())),
            payload: Value::Object(body),
            expected_action: Some(self.action.clone()),
        }
    }
}

/// Kinds without a translator are sent as the generic envelope.
pub fn generic_wire_command(envelope: &CommandEnvelope) -> WireCommand {
    WireCommand {
        payload: serde_json::to_value(envelope).unwrap_or(Value::Null),
        expected_action: Some(envelope.kind.clone()),
        expected_pin: pin_of(&envelope.data),
    }
}

/// Translators for the command kinds current firmware understands.
pub fn builtin_translators() -> HashMap<String, Arc<dyn CommandTranslator>> {
    let mut map: HashMap<String, Arc<dyn CommandTranslator>> = HashMap::new();
    map.insert(
        "gpio".to_string(),
        Arc::new(
            ActionTranslator::new("gpio")
                .field("pin", &["pin", "gpio"])
                .field("state", &["state", "value"]),
        ),
    );
    map.insert(
        "pwm".to_string(),
        Arc::new(
            ActionTranslator::new("pwm")
                .field("pin", &["pin"])
                .field("duty", &["duty", "value", "brightness"]),
        ),
    );
    map.insert(
        "servo".to_string(),
        Arc::new(
            ActionTranslator::new("servo")
                .field("pin", &["pin"])
                .field("angle", &["angle", "value", "position"]),
        ),
    );
    map.insert(
        "read_sensor".to_string(),
        Arc::new(
            ActionTranslator::new("read")
                .field("sensor", &["sensor", "sensor_type"])
                .field("pin", &["pin"]),
        ),
    );
    map.insert(
        "device_config".to_string(),
        Arc::new(ActionTranslator::new("config").field("devices", &["devices", "peripherals"])),
    );
    map.insert("restart".to_string(), Arc::new(ActionTranslator::new("restart")));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, data: Value) -> CommandEnvelope {
        CommandEnvelope {
            id: "cmd_1_1700000000000".to_string(),
            kind: kind.to_string(),
            data,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_gpio_translation() {
        let translators = builtin_translators();
        let wire = translators["gpio"].translate(&envelope("gpio", json!({"pin": 2, "state": "on"})));

        assert_eq!(
            wire.payload,
            json!({"id": "cmd_1_1700000000000", "action": "gpio", "pin": 2, "state": "on"})
        );
        assert_eq!(wire.expected_action.as_deref(), Some("gpio"));
        assert_eq!(wire.expected_pin, Some(2));
    }

    #[test]
    fn test_alternate_field_names() {
        let translators = builtin_translators();
        let wire = translators["pwm"].translate(&envelope("pwm", json!({"pin": "5", "brightness": 128})));
        assert_eq!(wire.payload["duty"], 128);
        assert_eq!(wire.expected_pin, Some(5));

        let wire = translators["read_sensor"].translate(&envelope("read_sensor", json!({"sensor_type": "dht22"})));
        assert_eq!(wire.payload["action"], "read");
        assert_eq!(wire.payload["sensor"], "dht22");
        assert_eq!(wire.expected_pin, None);
    }

    #[test]
    fn test_generic_envelope() {
        let wire = generic_wire_command(&envelope("blink", json!({"pin": 4, "times": 3})));
        assert_eq!(wire.payload["type"], "blink");
        assert_eq!(wire.payload["data"]["times"], 3);
        assert_eq!(wire.expected_action.as_deref(), Some("blink"));
        assert_eq!(wire.expected_pin, Some(4));
    }
}
