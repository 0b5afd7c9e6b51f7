//! The gateway facade: one connection, its router, dispatcher and handlers.
//!
//! An event task consumes the connection's event channel in order. On every
//! `Connected` it reissues recorded subscriptions, then makes sure the device
//! topics (`resp/+` and `register`) are routed. Inbound messages go to the
//! router one at a time.

use std::sync::Arc;
use std::time::Duration;

use fieldlink_core::config::GatewayConfig;
use fieldlink_core::{ConnectionState, EventBus, GatewayEvent, SharedEventBus};
use fieldlink_storage::GatewayStore;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::dispatcher::{CommandDispatcher, DispatcherStats};
use crate::error::Result;
use crate::processor::ResponseProcessor;
use crate::registrar::{AutoRegistrar, RegistrationHandler};
use crate::router::{MessageHandler, TopicRouter};
use crate::topic::response_wildcard;
use crate::transport::{ConnectionEvent, PublishOptions, Transport};

/// Everything the event task needs.
struct DeviceTopics {
    router: Arc<TopicRouter>,
    routes: Vec<(String, Arc<dyn MessageHandler>)>,
}

impl DeviceTopics {
    async fn ensure_routed(&self) {
        for (pattern, handler) in &self.routes {
            if self.router.has_route(pattern) {
                continue;
            }
            if let Err(e) = self.router.subscribe(pattern, handler.clone()).await {
                warn!(topic = %pattern, "Failed to subscribe device topic: {}", e);
            }
        }
    }
}

/// Entry point for collaborators: send commands, wait for acks, subscribe.
pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
    router: Arc<TopicRouter>,
    dispatcher: Arc<CommandDispatcher>,
    registrar: Arc<AutoRegistrar>,
    responses: Arc<ResponseProcessor>,
    event_bus: SharedEventBus,
    store: Arc<dyn GatewayStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Connect to the configured broker and start processing.
    pub fn start(config: GatewayConfig, store: Arc<dyn GatewayStore>) -> Self {
        let (connection, events) = ConnectionManager::initialize(&config.mqtt, &config.service_name);
        Self::with_transport(config, connection, events, store)
    }

    /// Build a gateway over any transport and its event stream.
    pub fn with_transport(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        store: Arc<dyn GatewayStore>,
    ) -> Self {
        let event_bus: SharedEventBus = Arc::new(EventBus::with_name(config.service_name.clone()));
        let topics = config.topics.clone();

        let router = Arc::new(TopicRouter::new(transport.clone()));
        let dispatcher = Arc::new(
            CommandDispatcher::new(transport.clone(), topics.clone())
                .with_event_bus(event_bus.clone())
                .with_store(store.clone()),
        );
        let registrar = Arc::new(
            AutoRegistrar::new(store.clone(), transport.clone(), topics.clone())
                .with_event_bus(event_bus.clone()),
        );
        let responses = Arc::new(
            ResponseProcessor::new(
                dispatcher.clone(),
                registrar.clone(),
                store.clone(),
                transport.clone(),
                topics.clone(),
            )
            .with_event_bus(event_bus.clone()),
        );
        let registration: Arc<dyn MessageHandler> = Arc::new(RegistrationHandler::new(
            registrar.clone(),
            &router,
            responses.clone(),
            topics.clone(),
        ));

        let device_topics = DeviceTopics {
            router: router.clone(),
            routes: vec![
                (response_wildcard(&topics), responses.clone() as Arc<dyn MessageHandler>),
                (topics.register_topic.clone(), registration),
            ],
        };

        let event_task = tokio::spawn(run_events(events, device_topics, event_bus.clone()));
        let reaper_task = tokio::spawn(run_reaper(
            dispatcher.clone(),
            Duration::from_secs(config.commands.reaper_interval_secs.max(1)),
            Duration::from_secs(config.commands.pending_ttl_secs),
        ));

        Self {
            config,
            transport,
            router,
            dispatcher,
            registrar,
            responses,
            event_bus,
            store,
            tasks: Mutex::new(vec![event_task, reaper_task]),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.router.subscribe(pattern, handler).await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.router.unsubscribe(pattern).await
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.transport.publish(topic, payload, options).await
    }

    pub async fn send_command(&self, target_id: &str, kind: &str, data: Value) -> Result<String> {
        self.dispatcher.send_command(target_id, kind, data).await
    }

    pub async fn wait_for_ack(&self, command_id: &str, timeout: Duration) -> bool {
        self.dispatcher.wait_for_ack(command_id, timeout).await
    }

    /// Send a command and wait for it using the configured default timeout.
    pub async fn send_and_wait(&self, target_id: &str, kind: &str, data: Value) -> Result<(String, bool)> {
        let id = self.send_command(target_id, kind, data).await?;
        let timeout = Duration::from_millis(self.config.commands.ack_timeout_ms);
        let acknowledged = self.wait_for_ack(&id, timeout).await;
        Ok((id, acknowledged))
    }

    /// Close the connection and stop background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.transport.disconnect().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Gateway stopped");
        result
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn registrar(&self) -> &Arc<AutoRegistrar> {
        &self.registrar
    }

    pub fn responses(&self) -> &Arc<ResponseProcessor> {
        &self.responses
    }

    pub fn store(&self) -> &Arc<dyn GatewayStore> {
        &self.store
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }
}

async fn run_events(
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    device_topics: DeviceTopics,
    event_bus: SharedEventBus,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged(state) => {
                event_bus.publish(GatewayEvent::ConnectionChanged { state });
                match state {
                    ConnectionState::Connected => {
                        device_topics.router.resubscribe_all().await;
                        device_topics.ensure_routed().await;
                    }
                    ConnectionState::Closed => break,
                    _ => {}
                }
            }
            ConnectionEvent::Message { topic, payload } => {
                device_topics.router.dispatch(&topic, &payload).await;
            }
        }
    }
    debug!("Gateway event task finished");
}

async fn run_reaper(dispatcher: Arc<CommandDispatcher>, interval: Duration, ttl: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        dispatcher.expire_stale(ttl);
    }
}
