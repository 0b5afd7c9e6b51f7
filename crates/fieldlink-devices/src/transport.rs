//! The seam between the protocol engine and the broker connection.

use async_trait::async_trait;
use fieldlink_core::ConnectionState;

use crate::error::Result;

/// Delivery assurance requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// Options for a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: Qos,
    pub retain: bool,
}

impl PublishOptions {
    /// Commands are not safe to drop silently.
    pub fn command() -> Self {
        Self {
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    pub fn retained(qos: Qos) -> Self {
        Self { qos, retain: true }
    }
}

/// Notifications emitted by a transport, strictly in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message { topic: String, payload: Vec<u8> },
}

/// A single logical connection to the broker.
///
/// Every operation fails fast with `NotConnected` unless the state is
/// `Connected`; nothing is queued for later delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()>;

    /// Resolves once the broker has confirmed the subscription.
    async fn subscribe(&self, pattern: &str) -> Result<()>;

    /// Resolves once the broker has confirmed the unsubscription.
    async fn unsubscribe(&self, pattern: &str) -> Result<()>;

    /// Close the connection for good. No reconnect follows.
    async fn disconnect(&self) -> Result<()>;
}
