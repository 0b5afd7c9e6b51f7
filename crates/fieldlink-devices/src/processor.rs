//! Handler for device response topics.
//!
//! Classifies each payload and applies its side effect: resolving commands,
//! updating device state, appending records, and broadcasting events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_core::config::TopicSettings;
use fieldlink_core::{GatewayEvent, SharedEventBus};
use fieldlink_storage::{DeviceRecord, GatewayStore, Record, RecordKind};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::classifier::{classify, parse_payload, ResponseEvent};
use crate::dispatcher::CommandDispatcher;
use crate::registrar::{AutoRegistrar, IdentityClaim};
use crate::router::MessageHandler;
use crate::topic::{command_topic, device_id_from_response_topic};
use crate::transport::{PublishOptions, Transport};

pub struct ResponseProcessor {
    dispatcher: Arc<CommandDispatcher>,
    registrar: Arc<AutoRegistrar>,
    store: Arc<dyn GatewayStore>,
    transport: Arc<dyn Transport>,
    topics: TopicSettings,
    event_bus: Option<SharedEventBus>,
    /// Last rejected claim per unknown device, so repeats are not re-acked.
    rejected: Mutex<HashMap<String, IdentityClaim>>,
}

impl ResponseProcessor {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        registrar: Arc<AutoRegistrar>,
        store: Arc<dyn GatewayStore>,
        transport: Arc<dyn Transport>,
        topics: TopicSettings,
    ) -> Self {
        Self {
            dispatcher,
            registrar,
            store,
            transport,
            topics,
            event_bus: None,
            rejected: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Classify and act on one response from `device_id`.
    pub async fn process(&self, device_id: &str, payload: &[u8]) -> ResponseEvent {
        let (value, is_json) = parse_payload(payload);
        if !is_json {
            warn!(device_id = %device_id, "Non-JSON response payload, storing as unclassified");
        }

        self.ensure_known(device_id, &value).await;

        let event = classify(&value);
        debug!(device_id = %device_id, kind = event.name(), "Classified response");

        match &event {
            ResponseEvent::Ack {
                command_id,
                success,
                error,
            } => {
                if let Some(error) = error {
                    debug!(command_id = %command_id, "Device reported command failure: {}", error);
                }
                self.dispatcher.resolve(command_id, *success);
            }
            ResponseEvent::FirmwareResponse {
                action,
                pin,
                success,
            } => {
                self.dispatcher
                    .resolve_by_action(device_id, action, *pin, *success);
            }
            ResponseEvent::StateChange { pin, state } => {
                self.update_device(device_id, |device| {
                    if let Some(pin) = pin {
                        device.pin_states.insert(*pin, state.clone());
                    }
                });
                self.append(device_id, RecordKind::StateChange, &value);
                self.broadcast(GatewayEvent::DeviceStateChanged {
                    device_id: device_id.to_string(),
                    pin: *pin,
                    state: state.clone(),
                });
            }
            ResponseEvent::Heartbeat => {
                self.update_device(device_id, |_| {});
                self.append(device_id, RecordKind::Heartbeat, &value);
                self.broadcast(GatewayEvent::DeviceHeartbeat {
                    device_id: device_id.to_string(),
                    payload: value.clone(),
                });
            }
            ResponseEvent::SensorReading => {
                self.append(device_id, RecordKind::SensorReading, &value);
                self.broadcast(GatewayEvent::SensorReading {
                    device_id: device_id.to_string(),
                    payload: value.clone(),
                });
            }
            ResponseEvent::ConfigSync { devices } => {
                let peripherals = devices.as_array().cloned().unwrap_or_default();
                self.update_device(device_id, |device| device.peripherals = peripherals);
                self.broadcast(GatewayEvent::DeviceConfigSynced {
                    device_id: device_id.to_string(),
                    devices: devices.clone(),
                });
            }
            ResponseEvent::ConfigRequest => self.send_config(device_id).await,
            ResponseEvent::Error { message } => {
                warn!(device_id = %device_id, "Device reported error: {}", message);
                self.append(device_id, RecordKind::DeviceError, &value);
                self.broadcast(GatewayEvent::DeviceError {
                    device_id: device_id.to_string(),
                    message: message.clone(),
                });
            }
            ResponseEvent::Unclassified => {
                self.append(device_id, RecordKind::Unclassified, &value);
                self.broadcast(GatewayEvent::Unclassified {
                    device_id: device_id.to_string(),
                    payload: value.clone(),
                });
            }
        }

        event
    }

    /// First contact from an unknown device triggers auto-registration,
    /// provided the payload names an owner. A claim that already failed is
    /// not retried until the device sends a different one.
    async fn ensure_known(&self, device_id: &str, payload: &Value) {
        match self.store.load_device(device_id) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(device_id = %device_id, "Device lookup failed: {}", e);
                return;
            }
        }

        let mut claim = IdentityClaim::from_payload(payload);
        claim.device_id = device_id.to_string();
        if !claim.names_owner() {
            debug!(device_id = %device_id, "Unknown device sent no ownership claim");
            return;
        }
        let already_rejected = self.rejected.lock().get(device_id) == Some(&claim);
        if already_rejected {
            debug!(device_id = %device_id, "Skipping previously rejected claim");
            return;
        }

        debug!(device_id = %device_id, "Response from unknown device, attempting registration");
        // Failures are acknowledged to the device by the registrar.
        match self.registrar.register(&claim).await {
            Ok(_) => {
                self.rejected.lock().remove(device_id);
            }
            Err(_) => {
                self.rejected.lock().insert(device_id.to_string(), claim);
            }
        }
    }

    /// Touch a known device and apply `change` to it.
    fn update_device<F>(&self, device_id: &str, change: F)
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let mut device = match self.store.load_device(device_id) {
            Ok(Some(device)) => device,
            Ok(None) => return,
            Err(e) => {
                warn!(device_id = %device_id, "Device lookup failed: {}", e);
                return;
            }
        };
        change(&mut device);
        device.touch(chrono::Utc::now().timestamp_millis());
        if let Err(e) = self.store.save_device(&device) {
            warn!(device_id = %device_id, "Failed to update device: {}", e);
        }
    }

    async fn send_config(&self, device_id: &str) {
        let device = self.store.load_device(device_id).ok().flatten();
        let devices = device
            .as_ref()
            .map(|d| Value::Array(d.peripherals.clone()))
            .unwrap_or_else(|| json!([]));
        let topic = device
            .and_then(|d| d.command_topic)
            .unwrap_or_else(|| command_topic(&self.topics, device_id));

        let payload = json!({ "action": "config", "devices": devices });
        if let Err(e) = self
            .transport
            .publish(&topic, payload.to_string().into_bytes(), PublishOptions::command())
            .await
        {
            warn!(device_id = %device_id, "Failed to send configuration: {}", e);
        }
    }

    fn append(&self, device_id: &str, kind: RecordKind, data: &Value) {
        if let Err(e) = self.store.append(Record::new(device_id, kind, data.clone())) {
            warn!(device_id = %device_id, "Failed to append record: {}", e);
        }
    }

    fn broadcast(&self, event: GatewayEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

#[async_trait]
impl MessageHandler for ResponseProcessor {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        match device_id_from_response_topic(&self.topics, topic) {
            Some(device_id) => {
                self.process(device_id, payload).await;
            }
            None => debug!(topic = %topic, "Response topic carries no device id"),
        }
    }
}
