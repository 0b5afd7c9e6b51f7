//! Device identity resolution and auto-registration.
//!
//! A device announces itself with a claim naming the account it belongs to.
//! The owning account is looked up by short id, then email, then numeric id;
//! the first hit wins. Without an account nothing is persisted and the
//! device is told so.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fieldlink_core::config::TopicSettings;
use fieldlink_core::{GatewayEvent, SharedEventBus};
use fieldlink_storage::{Account, DeviceRecord, DeviceUpdate, GatewayStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::classifier::parse_payload;
use crate::error::RegistrationError;
use crate::router::{MessageHandler, TopicRouter};
use crate::topic::{command_topic, response_topic};
use crate::transport::{PublishOptions, Transport};

/// What a device says about itself when it asks to be registered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityClaim {
    pub device_id: String,
    pub short_id: Option<String>,
    pub email: Option<String>,
    pub user_id: Option<i64>,
    pub mac_address: Option<String>,
    pub display_name: Option<String>,
    pub location: Option<String>,
    pub reply_topic: Option<String>,
}

fn text(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl IdentityClaim {
    /// Read a claim from a registration payload, accepting both camelCase
    /// and snake_case field names.
    pub fn from_payload(payload: &Value) -> Self {
        let user_id = ["userId", "user_id"]
            .iter()
            .find_map(|key| payload.get(*key))
            .and_then(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            });

        Self {
            device_id: text(payload, &["deviceId", "device_id"]).unwrap_or_default(),
            short_id: text(payload, &["shortId", "short_id", "user_short_id"]),
            email: text(payload, &["email", "userEmail"]),
            user_id,
            mac_address: text(payload, &["macAddress", "mac_address", "mac"]),
            display_name: text(payload, &["displayName", "display_name", "name"]),
            location: text(payload, &["location"]),
            reply_topic: text(payload, &["replyTopic", "reply_topic"]),
        }
    }

    /// Whether the claim names an owning account in any form.
    pub fn names_owner(&self) -> bool {
        self.short_id.is_some() || self.email.is_some() || self.user_id.is_some()
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub device: DeviceRecord,
    pub account: Account,
    /// `false` when an existing record was coalesced.
    pub created: bool,
}

/// Resolves claims against the store and persists device records.
pub struct IdentityResolver {
    store: Arc<dyn GatewayStore>,
    topics: TopicSettings,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn GatewayStore>, topics: TopicSettings) -> Self {
        Self { store, topics }
    }

    /// Validate, resolve the owner and create or coalesce the device record.
    ///
    /// A claim without a short id is rejected before any lookup happens.
    pub fn resolve(&self, claim: &IdentityClaim) -> Result<Registration, RegistrationError> {
        if claim.device_id.is_empty() {
            return Err(RegistrationError::MissingDeviceId);
        }
        let short_id = match claim.short_id.as_deref() {
            Some(short_id) => short_id,
            None => return Err(RegistrationError::MissingShortId(claim.device_id.clone())),
        };

        let account = self.lookup_account(short_id, claim)?.ok_or_else(|| {
            RegistrationError::NoAccount {
                device_id: claim.device_id.clone(),
            }
        })?;

        let now = chrono::Utc::now().timestamp_millis();
        let update = DeviceUpdate {
            account_id: Some(account.id),
            mac_address: claim.mac_address.clone(),
            display_name: claim.display_name.clone(),
            location: claim.location.clone(),
            command_topic: Some(command_topic(&self.topics, &claim.device_id)),
            response_topic: Some(response_topic(&self.topics, &claim.device_id)),
        };

        let (mut device, created) = match self.store.load_device(&claim.device_id)? {
            Some(mut existing) => {
                existing.coalesce(update, now);
                (existing, false)
            }
            None => (DeviceRecord::from_update(&claim.device_id, update, now), true),
        };
        device.touch(now);
        self.store.save_device(&device)?;

        Ok(Registration {
            device,
            account,
            created,
        })
    }

    fn lookup_account(
        &self,
        short_id: &str,
        claim: &IdentityClaim,
    ) -> Result<Option<Account>, RegistrationError> {
        if let Some(account) = self.store.find_account_by_short_id(short_id)? {
            return Ok(Some(account));
        }
        if let Some(email) = claim.email.as_deref() {
            if let Some(account) = self.store.find_account_by_email(email)? {
                return Ok(Some(account));
            }
        }
        if let Some(user_id) = claim.user_id {
            if let Some(account) = self.store.find_account_by_id(user_id)? {
                return Ok(Some(account));
            }
        }
        Ok(None)
    }
}

/// Registration acknowledgment sent back to the device.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationAck {
    pub action: &'static str,
    pub status: &'static str,
    pub user_short_id: Option<String>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resolves a claim, then tells the device and the fan-out layer the outcome.
pub struct AutoRegistrar {
    resolver: IdentityResolver,
    transport: Arc<dyn Transport>,
    topics: TopicSettings,
    event_bus: Option<SharedEventBus>,
}

impl AutoRegistrar {
    pub fn new(
        store: Arc<dyn GatewayStore>,
        transport: Arc<dyn Transport>,
        topics: TopicSettings,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(store, topics.clone()),
            transport,
            topics,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Resolve a claim and acknowledge it to the device.
    ///
    /// The acknowledgment goes to the claim's reply topic if it names one,
    /// otherwise to the device's command topic. A claim with no device id
    /// and no reply topic cannot be answered.
    pub async fn register(&self, claim: &IdentityClaim) -> Result<Registration, RegistrationError> {
        let result = self.resolver.resolve(claim);
        let timestamp = chrono::Utc::now().timestamp_millis();

        let ack = match &result {
            Ok(registration) => {
                info!(
                    device_id = %claim.device_id,
                    account_id = registration.account.id,
                    created = registration.created,
                    "Device registered"
                );
                if let Some(bus) = &self.event_bus {
                    bus.publish(GatewayEvent::DeviceRegistered {
                        device_id: claim.device_id.clone(),
                        account_id: registration.account.id,
                        created: registration.created,
                    });
                }
                RegistrationAck {
                    action: "registered",
                    status: "success",
                    user_short_id: Some(registration.account.short_id.clone()),
                    timestamp,
                    error: None,
                }
            }
            Err(e) => {
                warn!(device_id = %claim.device_id, "Registration failed: {}", e);
                RegistrationAck {
                    action: "registered",
                    status: "failed",
                    user_short_id: claim.short_id.clone(),
                    timestamp,
                    error: Some(e.to_string()),
                }
            }
        };

        let reply_topic = claim.reply_topic.clone().or_else(|| {
            (!claim.device_id.is_empty()).then(|| command_topic(&self.topics, &claim.device_id))
        });
        match reply_topic {
            Some(topic) => self.send_ack(&topic, &ack).await,
            None => debug!("Registration without deviceId or replyTopic left unanswered"),
        }

        result
    }

    async fn send_ack(&self, topic: &str, ack: &RegistrationAck) {
        let payload = match serde_json::to_vec(ack) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode registration ack: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(topic, payload, PublishOptions::command())
            .await
        {
            warn!(topic = %topic, "Failed to send registration ack: {}", e);
        }
    }
}

/// Handler for the `register` topic.
///
/// After a successful registration it makes sure the device's response
/// topic is routed to `responses`, unless an existing route already covers it.
pub struct RegistrationHandler {
    registrar: Arc<AutoRegistrar>,
    router: Weak<TopicRouter>,
    responses: Arc<dyn MessageHandler>,
    topics: TopicSettings,
}

impl RegistrationHandler {
    pub fn new(
        registrar: Arc<AutoRegistrar>,
        router: &Arc<TopicRouter>,
        responses: Arc<dyn MessageHandler>,
        topics: TopicSettings,
    ) -> Self {
        Self {
            registrar,
            router: Arc::downgrade(router),
            responses,
            topics,
        }
    }
}

#[async_trait]
impl MessageHandler for RegistrationHandler {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        let (value, is_json) = parse_payload(payload);
        if !is_json {
            warn!(topic = %topic, "Ignoring non-JSON registration payload");
            return;
        }

        let claim = IdentityClaim::from_payload(&value);
        let registration = match self.registrar.register(&claim).await {
            Ok(registration) => registration,
            Err(_) => return,
        };

        let Some(router) = self.router.upgrade() else {
            return;
        };
        let resp_topic = registration
            .device
            .response_topic
            .clone()
            .unwrap_or_else(|| response_topic(&self.topics, &claim.device_id));
        if router.is_covered(&resp_topic) {
            debug!(topic = %resp_topic, "Response topic already routed");
            return;
        }
        if let Err(e) = router.subscribe(&resp_topic, self.responses.clone()).await {
            warn!(topic = %resp_topic, "Failed to subscribe device response topic: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use fieldlink_storage::{DeviceStore, MemoryStore};
    use serde_json::json;

    fn store_with_account() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .save_account(&Account::new(7, "ABC123", "owner@example.com"))
            .unwrap();
        store
    }

    #[test]
    fn test_claim_from_payload() {
        let claim = IdentityClaim::from_payload(&json!({
            "deviceId": "ESP32_1",
            "shortId": " ABC123 ",
            "mac": "AA:BB",
            "userId": "7",
            "replyTopic": "boot/ESP32_1"
        }));
        assert_eq!(claim.device_id, "ESP32_1");
        assert_eq!(claim.short_id.as_deref(), Some("ABC123"));
        assert_eq!(claim.mac_address.as_deref(), Some("AA:BB"));
        assert_eq!(claim.user_id, Some(7));
        assert_eq!(claim.reply_topic.as_deref(), Some("boot/ESP32_1"));
    }

    #[test]
    fn test_lookup_order_falls_back_to_email_then_id() {
        let store = store_with_account();
        let resolver = IdentityResolver::new(store.clone(), TopicSettings::default());

        let by_email = resolver
            .resolve(&IdentityClaim {
                device_id: "a".to_string(),
                short_id: Some("UNKNOWN".to_string()),
                email: Some("OWNER@example.com".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_email.account.id, 7);

        let by_id = resolver
            .resolve(&IdentityClaim {
                device_id: "b".to_string(),
                short_id: Some("UNKNOWN".to_string()),
                user_id: Some(7),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.account.id, 7);
        assert!(by_id.created);
        assert_eq!(by_id.device.command_topic.as_deref(), Some("cmd/b"));
    }

    #[test]
    fn test_no_account_persists_nothing() {
        let store = store_with_account();
        let resolver = IdentityResolver::new(store.clone(), TopicSettings::default());

        let result = resolver.resolve(&IdentityClaim {
            device_id: "stray".to_string(),
            short_id: Some("NOPE".to_string()),
            ..Default::default()
        });
        assert_eq!(
            result,
            Err(RegistrationError::NoAccount {
                device_id: "stray".to_string()
            })
        );
        assert!(store.load_device("stray").unwrap().is_none());
    }

    #[test]
    fn test_existing_device_is_coalesced() {
        let store = store_with_account();
        store
            .save_device(&DeviceRecord {
                device_id: "ESP32_1".to_string(),
                account_id: Some(1),
                mac_address: Some("11:11".to_string()),
                command_topic: Some("custom/in".to_string()),
                created_at: 5,
                ..Default::default()
            })
            .unwrap();
        let resolver = IdentityResolver::new(store.clone(), TopicSettings::default());

        let registration = resolver
            .resolve(&IdentityClaim {
                device_id: "ESP32_1".to_string(),
                short_id: Some("ABC123".to_string()),
                mac_address: Some("22:22".to_string()),
                location: Some("garage".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(!registration.created);

        let saved = store.load_device("ESP32_1").unwrap().unwrap();
        assert_eq!(saved.account_id, Some(1));
        assert_eq!(saved.mac_address.as_deref(), Some("11:11"));
        assert_eq!(saved.command_topic.as_deref(), Some("custom/in"));
        assert_eq!(saved.response_topic.as_deref(), Some("resp/ESP32_1"));
        assert_eq!(saved.location.as_deref(), Some("garage"));
        assert_eq!(saved.created_at, 5);
        assert!(saved.online);
    }

    #[tokio::test]
    async fn test_register_acks_to_reply_topic() {
        let store = store_with_account();
        let transport = MockTransport::connected();
        let registrar = AutoRegistrar::new(store, transport.clone(), TopicSettings::default());

        registrar
            .register(&IdentityClaim {
                device_id: "ESP32_1".to_string(),
                short_id: Some("ABC123".to_string()),
                reply_topic: Some("boot/ESP32_1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let ack = transport.last_published_json("boot/ESP32_1").unwrap();
        assert_eq!(ack["action"], "registered");
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["user_short_id"], "ABC123");
        assert!(ack.get("error").is_none());
        assert!(transport.published_to("cmd/ESP32_1").is_empty());
    }

    #[tokio::test]
    async fn test_failed_registration_is_acknowledged() {
        let store = store_with_account();
        let transport = MockTransport::connected();
        let registrar = AutoRegistrar::new(store, transport.clone(), TopicSettings::default());

        let result = registrar
            .register(&IdentityClaim {
                device_id: "ESP32_9".to_string(),
                short_id: Some("ZZZ".to_string()),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());

        let ack = transport.last_published_json("cmd/ESP32_9").unwrap();
        assert_eq!(ack["status"], "failed");
        assert!(ack["error"].as_str().unwrap().contains("No account"));
    }
}
