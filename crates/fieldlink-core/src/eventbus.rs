//! Event bus for the gateway.
//!
//! The bus is the seam between the protocol core and the real-time fan-out
//! layer: the core publishes, front-end bridges subscribe. Events from one
//! publisher are delivered to each subscriber in publish order.

use crate::event::{EventMetadata, GatewayEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events buffered per subscriber before the slowest one starts lagging.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<(GatewayEvent, EventMetadata)>,
    name: String,
}

impl EventBus {
    pub fn new() -> Self {
        Self::build("gateway", DEFAULT_CHANNEL_CAPACITY)
    }

    /// Bus with a custom per-subscriber buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build("gateway", capacity)
    }

    /// Bus labelled with the owning service, used in log lines.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::build(name, DEFAULT_CHANNEL_CAPACITY)
    }

    fn build(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with the "gateway" source.
    ///
    /// Returns `true` if there was at least one subscriber. Publishing with
    /// no subscribers discards the event.
    pub fn publish(&self, event: GatewayEvent) -> bool {
        self.publish_with_source(event, "gateway")
    }

    pub fn publish_with_source(&self, event: GatewayEvent, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    pub fn publish_with_metadata(&self, event: GatewayEvent, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    /// Every event from now on. A subscriber that falls behind loses the oldest ones.
    pub fn subscribe(&self) -> EventBusReceiver {
        EventBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Only the events `filter` accepts.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<F>
    where
        F: Fn(&GatewayEvent) -> bool + Send + 'static,
    {
        FilteredReceiver::new(self.tx.subscribe(), filter)
    }

    /// Subscribe to events concerning one device.
    pub fn subscribe_device(
        &self,
        device_id: impl Into<String>,
    ) -> FilteredReceiver<impl Fn(&GatewayEvent) -> bool + Send + 'static> {
        let target = device_id.into();
        FilteredReceiver::new(self.tx.subscribe(), move |event: &GatewayEvent| {
            event.device_id() == Some(target.as_str())
        })
    }

    pub fn command_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), GatewayEvent::is_command_event as fn(&GatewayEvent) -> bool)
    }

    pub fn device_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), GatewayEvent::is_device_event as fn(&GatewayEvent) -> bool)
    }

    pub fn connection_events(&self) -> FilteredReceiver<fn(&GatewayEvent) -> bool> {
        FilteredReceiver::new(self.tx.subscribe(), GatewayEvent::is_connection_event as fn(&GatewayEvent) -> bool)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEventBus = Arc<EventBus>;

/// Unfiltered subscription handle.
pub struct EventBusReceiver {
    rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>,
}

impl EventBusReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` once the bus is closed. Lagging skips the dropped
    /// events and continues with the oldest retained one.
    pub async fn recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        self.rx.try_recv().ok()
    }
}

/// Subscription that skips events the predicate rejects.
pub struct FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>,
    filter: F,
}

impl<F> FilteredReceiver<F>
where
    F: Fn(&GatewayEvent) -> bool + Send,
{
    fn new(rx: broadcast::Receiver<(GatewayEvent, EventMetadata)>, filter: F) -> Self {
        Self { rx, filter }
    }

    pub async fn recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok((event, meta)) => {
                    if (self.filter)(&event) {
                        return Some((event, meta));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drains non-matching events until a match or an empty channel.
    pub fn try_recv(&mut self) -> Option<(GatewayEvent, EventMetadata)> {
        while let Ok((event, meta)) = self.rx.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}
