//! In-process transport for exercising the engine without a broker.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fieldlink_core::ConnectionState;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{GatewayError, Result};
use crate::transport::{ConnectionEvent, PublishOptions, Transport};

/// A message handed to [`MockTransport::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Default)]
struct MockState {
    connection: ConnectionState,
    published: Vec<PublishedMessage>,
    subscriptions: HashSet<String>,
    subscribe_requests: Vec<String>,
    rejected: HashSet<String>,
}

/// Records publishes and subscriptions and lets tests drive the connection.
///
/// Connection changes and inbound messages are emitted on the event channel
/// returned by [`MockTransport::new`], the same way a real connection would.
pub struct MockTransport {
    inner: Mutex<MockState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inner: Mutex::new(MockState::default()),
            events,
        });
        (transport, rx)
    }

    /// Mock that is already connected, with its event stream discarded.
    pub fn connected() -> Arc<Self> {
        let (transport, _rx) = Self::new();
        transport.inner.lock().connection = ConnectionState::Connected;
        transport
    }

    pub fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.connection != state;
            inner.connection = state;
            changed
        };
        if changed {
            let _ = self.events.send(ConnectionEvent::StateChanged(state));
        }
    }

    /// Simulate an inbound message from the broker.
    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self.events.send(ConnectionEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }

    pub fn deliver_json(&self, topic: &str, payload: &Value) {
        self.deliver(topic, payload.to_string());
    }

    /// Make the broker refuse subscriptions to this pattern.
    pub fn reject_subscription(&self, pattern: &str) {
        self.inner.lock().rejected.insert(pattern.to_string());
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_published_json(&self, topic: &str) -> Option<Value> {
        self.published_to(topic).last().and_then(|m| m.json())
    }

    pub fn clear_published(&self) {
        self.inner.lock().published.clear();
    }

    /// Patterns currently subscribed at the broker.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.inner.lock().subscriptions.clone()
    }

    /// Every subscribe request in the order it was made, including repeats.
    pub fn subscribe_requests(&self) -> Vec<String> {
        self.inner.lock().subscribe_requests.clone()
    }

    fn ensure_connected(&self, inner: &MockState) -> Result<()> {
        if inner.connection == ConnectionState::Connected {
            Ok(())
        } else {
            Err(GatewayError::NotConnected(inner.connection))
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_connected(&inner)?;
        inner.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            options,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_connected(&inner)?;
        inner.subscribe_requests.push(pattern.to_string());
        if inner.rejected.contains(pattern) {
            return Err(GatewayError::SubscriptionRejected(pattern.to_string()));
        }
        inner.subscriptions.insert(pattern.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        self.ensure_connected(&inner)?;
        inner.subscriptions.remove(pattern);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_operations_fail_fast() {
        let (transport, _rx) = MockTransport::new();
        let result = transport
            .publish("cmd/x", b"{}".to_vec(), PublishOptions::default())
            .await;
        assert!(matches!(
            result,
            Err(GatewayError::NotConnected(ConnectionState::Disconnected))
        ));
        assert!(transport.subscribe("resp/+").await.is_err());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_state_changes_are_emitted() {
        let (transport, mut rx) = MockTransport::new();
        transport.set_state(ConnectionState::Connected);
        transport.set_state(ConnectionState::Connected);
        transport.deliver("resp/a", "hi");

        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::StateChanged(ConnectionState::Connected))
        );
        assert_eq!(
            rx.recv().await,
            Some(ConnectionEvent::Message {
                topic: "resp/a".to_string(),
                payload: b"hi".to_vec()
            })
        );
    }
}
