//! Classification of device response payloads.
//!
//! Precedence is fixed: explicit ack, firmware response, state change,
//! heartbeat/status, sensor reading, configuration sync/request, error,
//! and finally unclassified. The first rule that applies wins.

use serde_json::{json, Value};

/// A classified device response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// `{type:"ack", commandId, success, error?}`
    Ack {
        command_id: String,
        success: bool,
        error: Option<String>,
    },
    /// `{status, action, details:{pin}}` from firmware that cannot echo ids.
    FirmwareResponse {
        action: String,
        pin: Option<i64>,
        success: bool,
    },
    StateChange {
        pin: Option<i64>,
        state: Value,
    },
    Heartbeat,
    SensorReading,
    ConfigSync {
        devices: Value,
    },
    ConfigRequest,
    Error {
        message: String,
    },
    Unclassified,
}

impl ResponseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseEvent::Ack { .. } => "ack",
            ResponseEvent::FirmwareResponse { .. } => "firmware_response",
            ResponseEvent::StateChange { .. } => "state_change",
            ResponseEvent::Heartbeat => "heartbeat",
            ResponseEvent::SensorReading => "sensor_reading",
            ResponseEvent::ConfigSync { .. } => "config_sync",
            ResponseEvent::ConfigRequest => "config_request",
            ResponseEvent::Error { .. } => "error",
            ResponseEvent::Unclassified => "unclassified",
        }
    }
}

const STATE_TYPES: &[&str] = &["gpio_state", "state_change", "pin_state"];
const HEARTBEAT_TYPES: &[&str] = &["heartbeat", "status"];
const SENSOR_TYPES: &[&str] = &["sensor", "sensor_data", "sensor_reading", "reading"];
const CONFIG_SYNC_TYPES: &[&str] = &["config_sync", "device_list"];

/// Parse a raw payload. Non-JSON input is wrapped as `{raw_message}`.
///
/// The flag is `false` when the payload had to be wrapped.
pub fn parse_payload(payload: &[u8]) -> (Value, bool) {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) if value.is_object() => (value, true),
        Ok(value) => (json!({ "raw_message": value }), true),
        Err(_) => (
            json!({ "raw_message": String::from_utf8_lossy(payload) }),
            false,
        ),
    }
}

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn int_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn type_in(payload: &Value, types: &[&str]) -> bool {
    str_field(payload, "type").map_or(false, |t| types.contains(&t))
}

/// Classify a parsed payload.
pub fn classify(payload: &Value) -> ResponseEvent {
    if str_field(payload, "type") == Some("ack") {
        if let Some(command_id) = str_field(payload, "commandId") {
            return ResponseEvent::Ack {
                command_id: command_id.to_string(),
                success: payload.get("success").and_then(Value::as_bool).unwrap_or(false),
                error: str_field(payload, "error").map(str::to_string),
            };
        }
    }

    if let (Some(status), Some(action)) = (str_field(payload, "status"), str_field(payload, "action")) {
        let pin = payload
            .get("details")
            .and_then(|details| int_field(details.get("pin")))
            .or_else(|| int_field(payload.get("pin")));
        return ResponseEvent::FirmwareResponse {
            action: action.to_string(),
            pin,
            success: status == "success" || status == "ok",
        };
    }

    let has_pin_state = payload.get("pin").is_some() && payload.get("state").is_some();
    if type_in(payload, STATE_TYPES) || (payload.get("type").is_none() && has_pin_state) {
        return ResponseEvent::StateChange {
            pin: int_field(payload.get("pin")),
            state: payload.get("state").cloned().unwrap_or(Value::Null),
        };
    }

    if type_in(payload, HEARTBEAT_TYPES) {
        return ResponseEvent::Heartbeat;
    }

    if type_in(payload, SENSOR_TYPES)
        || (payload.get("type").is_none()
            && payload.get("sensor").is_some()
            && payload.get("value").is_some())
    {
        return ResponseEvent::SensorReading;
    }

    if type_in(payload, CONFIG_SYNC_TYPES) {
        return ResponseEvent::ConfigSync {
            devices: payload.get("devices").cloned().unwrap_or_else(|| json!([])),
        };
    }
    if str_field(payload, "type") == Some("config_request") {
        return ResponseEvent::ConfigRequest;
    }

    if str_field(payload, "type") == Some("error") || payload.get("error").is_some() {
        let message = match payload.get("error").or_else(|| payload.get("message")) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unspecified device error".to_string(),
        };
        return ResponseEvent::Error { message };
    }

    ResponseEvent::Unclassified
}
