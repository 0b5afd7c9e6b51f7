//! The single broker connection, backed by rumqttc.
//!
//! A spawned task polls the event loop for the lifetime of the connection.
//! It owns the state machine (`Connecting -> Connected <-> Offline -> Closed`),
//! forwards inbound publishes, and completes subscribe/unsubscribe requests
//! once the broker acknowledges them. State changes and messages leave on
//! one channel so consumers see them in the order they happened.
//!
//! SUBACK and UNSUBACK carry only a packet id. Requests are queued before they
//! reach the client under a lock, and the event loop reports outgoing packets
//! in request order, so each outgoing `Subscribe(pkid)` is paired with the
//! front of the queue and the matching SUBACK later completes it. Requests
//! failed by a connection loss before they went out still sit in the client's
//! channel; their outgoing packets are counted off and dropped so they never
//! claim a later request's slot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldlink_core::config::MqttSettings;
use fieldlink_core::ConnectionState;
use parking_lot::Mutex;
use rand::Rng;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, NetworkOptions,
    Outgoing, Packet, QoS, SubscribeReasonCode,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};
use crate::transport::{ConnectionEvent, PublishOptions, Qos, Transport};

/// Keep-alive below this is refused by the client.
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// How long `disconnect` waits for the poll task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Responder = oneshot::Sender<Result<()>>;

/// Client id unique per process instance: `{base}_{pid}_{6 hex}`.
pub fn instance_client_id(base: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}_{}_{:06x}", base, std::process::id(), suffix)
}

fn status_payload(service: &str, status: &str) -> Vec<u8> {
    json!({
        "service": service,
        "status": status,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    })
    .to_string()
    .into_bytes()
}

/// Requests waiting for their broker acknowledgment.
#[derive(Default)]
struct AckTracker {
    queued_subscribes: VecDeque<(String, Responder)>,
    subscribes: HashMap<u16, (String, Responder)>,
    queued_unsubscribes: VecDeque<(String, Responder)>,
    unsubscribes: HashMap<u16, (String, Responder)>,
    /// Failed requests the client has yet to send.
    orphaned_subscribes: usize,
    orphaned_unsubscribes: usize,
}

impl AckTracker {
    /// Fail everything in flight; the broker will never answer these.
    fn fail_all(&mut self, state: ConnectionState) {
        self.orphaned_subscribes += self.queued_subscribes.len();
        self.orphaned_unsubscribes += self.queued_unsubscribes.len();

        let queued = self
            .queued_subscribes
            .drain(..)
            .chain(self.queued_unsubscribes.drain(..));
        let sent = self
            .subscribes
            .drain()
            .chain(self.unsubscribes.drain())
            .map(|(_, entry)| entry);
        for (_, responder) in queued.chain(sent) {
            let _ = responder.send(Err(GatewayError::NotConnected(state)));
        }
    }

    /// Pair an outgoing SUBSCRIBE with its request. Returns the pattern.
    fn subscribe_sent(&mut self, pkid: u16) -> Option<String> {
        if self.orphaned_subscribes > 0 {
            self.orphaned_subscribes -= 1;
            debug!(pkid, "Outgoing subscribe belongs to a failed request");
            return None;
        }
        let (pattern, responder) = self.queued_subscribes.pop_front()?;
        self.subscribes.insert(pkid, (pattern.clone(), responder));
        Some(pattern)
    }

    fn unsubscribe_sent(&mut self, pkid: u16) -> Option<String> {
        if self.orphaned_unsubscribes > 0 {
            self.orphaned_unsubscribes -= 1;
            debug!(pkid, "Outgoing unsubscribe belongs to a failed request");
            return None;
        }
        let (pattern, responder) = self.queued_unsubscribes.pop_front()?;
        self.unsubscribes.insert(pkid, (pattern.clone(), responder));
        Some(pattern)
    }
}

/// State shared between the manager and its poll task.
struct Shared {
    service_name: String,
    status_topic: String,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    acks: Mutex<AckTracker>,
    closed: AtomicBool,
}

impl Shared {
    /// Move to `new` and emit the change. `Closed` is final.
    fn transition(&self, new: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == new || *current == ConnectionState::Closed {
                false
            } else {
                *current = new;
                true
            }
        });
        if changed {
            info!(state = %new, "Broker connection state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(new));
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

/// Owns the process-wide broker connection.
pub struct ConnectionManager {
    client: AsyncClient,
    client_id: String,
    broker_addr: String,
    confirm_timeout: Duration,
    shared: Arc<Shared>,
    request_lock: tokio::sync::Mutex<()>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Open the connection and start polling.
    ///
    /// Returns immediately; progress is reported on the returned event channel
    /// starting with `Connecting`. Must be called within a tokio runtime.
    pub fn initialize(
        settings: &MqttSettings,
        service_name: &str,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let client_id = instance_client_id(&settings.client_id);
        let mut options = MqttOptions::new(&client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(
            settings.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        options.set_clean_session(settings.clean_session);
        if let Some((username, password)) = settings.credentials() {
            options.set_credentials(username, password);
        }
        options.set_last_will(LastWill::new(
            &settings.status_topic,
            status_payload(service_name, "offline"),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut eventloop) =
            AsyncClient::new(options, settings.request_channel_capacity.max(1));
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(settings.connect_timeout_secs);
        eventloop.set_network_options(network);

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            service_name: service_name.to_string(),
            status_topic: settings.status_topic.clone(),
            state,
            events,
            acks: Mutex::new(AckTracker::default()),
            closed: AtomicBool::new(false),
        });

        shared.transition(ConnectionState::Connecting);
        info!(
            client_id = %client_id,
            broker = %settings.broker_addr(),
            "Connecting to MQTT broker"
        );

        let reconnect_delay = Duration::from_millis(settings.reconnect_period_ms);
        let handle = tokio::spawn(poll_loop(
            eventloop,
            client.clone(),
            shared.clone(),
            reconnect_delay,
        ));

        let manager = Arc::new(Self {
            client,
            client_id,
            broker_addr: settings.broker_addr(),
            confirm_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            shared,
            request_lock: tokio::sync::Mutex::new(()),
            poll_task: Mutex::new(Some(handle)),
        });
        (manager, events_rx)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker_addr(&self) -> &str {
        &self.broker_addr
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.shared.current() {
            ConnectionState::Connected => Ok(()),
            other => Err(GatewayError::NotConnected(other)),
        }
    }

    async fn await_confirmation(&self, pattern: &str, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        match tokio::time::timeout(self.confirm_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::NotConnected(self.shared.current())),
            Err(_) => Err(GatewayError::Client(format!(
                "broker did not acknowledge {} within {:?}",
                pattern, self.confirm_timeout
            ))),
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.ensure_connected()?;
        self.client
            .publish(topic, options.qos.into(), options.retain, payload)
            .await
            .map_err(|e| {
                warn!(topic = %topic, "Publish failed: {}", e);
                GatewayError::from(e)
            })
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_connected()?;
        let rx = {
            let _guard = self.request_lock.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared
                .acks
                .lock()
                .queued_subscribes
                .push_back((pattern.to_string(), tx));
            if let Err(e) = self.client.subscribe(pattern, Qos::AtLeastOnce.into()).await {
                self.shared.acks.lock().queued_subscribes.pop_back();
                return Err(e.into());
            }
            rx
        };
        self.await_confirmation(pattern, rx).await
    }

    async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.ensure_connected()?;
        let rx = {
            let _guard = self.request_lock.lock().await;
            let (tx, rx) = oneshot::channel();
            self.shared
                .acks
                .lock()
                .queued_unsubscribes
                .push_back((pattern.to_string(), tx));
            if let Err(e) = self.client.unsubscribe(pattern).await {
                self.shared.acks.lock().queued_unsubscribes.pop_back();
                return Err(e.into());
            }
            rx
        };
        self.await_confirmation(pattern, rx).await
    }

    async fn disconnect(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let was_connected = self.shared.current() == ConnectionState::Connected;

        if was_connected {
            // A clean disconnect suppresses the last will, so announce it ourselves.
            let _ = self.client.try_publish(
                &self.shared.status_topic,
                QoS::AtLeastOnce,
                true,
                status_payload(&self.shared.service_name, "offline"),
            );
            if let Err(e) = self.client.try_disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
        }

        self.shared.transition(ConnectionState::Closed);
        self.shared.acks.lock().fail_all(ConnectionState::Closed);

        let handle = self.poll_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        info!(client_id = %self.client_id, "Disconnected from MQTT broker");
        Ok(())
    }
}

async fn poll_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
) {
    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code != ConnectReturnCode::Success {
                    warn!("Broker refused connection: {:?}", connack.code);
                    continue;
                }
                shared.transition(ConnectionState::Connected);
                if let Err(e) = client.try_publish(
                    &shared.status_topic,
                    QoS::AtLeastOnce,
                    true,
                    status_payload(&shared.service_name, "online"),
                ) {
                    warn!("Failed to publish online status: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = shared.events.send(ConnectionEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                let entry = shared.acks.lock().subscribes.remove(&suback.pkid);
                if let Some((pattern, responder)) = entry {
                    let rejected = suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    let result = if rejected {
                        warn!(topic = %pattern, "Broker rejected subscription");
                        Err(GatewayError::SubscriptionRejected(pattern))
                    } else {
                        Ok(())
                    };
                    let _ = responder.send(result);
                }
            }
            Ok(Event::Incoming(Packet::UnsubAck(unsuback))) => {
                let entry = shared.acks.lock().unsubscribes.remove(&unsuback.pkid);
                if let Some((_, responder)) = entry {
                    let _ = responder.send(Ok(()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Some(pattern) = shared.acks.lock().subscribe_sent(pkid) {
                    debug!(pkid, topic = %pattern, "Subscribe sent");
                }
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                if let Some(pattern) = shared.acks.lock().unsubscribe_sent(pkid) {
                    debug!(pkid, topic = %pattern, "Unsubscribe sent");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent to broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                match shared.current() {
                    ConnectionState::Connected => {
                        error!("MQTT connection lost: {}", e)
                    }
                    _ => warn!("MQTT connection attempt failed: {}", e),
                }
                shared.transition(ConnectionState::Offline);
                shared.acks.lock().fail_all(ConnectionState::Offline);
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    shared.transition(ConnectionState::Closed);
    debug!("MQTT poll loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_client_id_format() {
        let id = instance_client_id("fieldlink");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "fieldlink");
        assert_eq!(parts[1], std::process::id().to_string());
        assert_eq!(parts[2].len(), 6);
        assert!(u32::from_str_radix(parts[2], 16).is_ok());
    }

    #[test]
    fn test_status_payload() {
        let payload: serde_json::Value =
            serde_json::from_slice(&status_payload("fieldlink", "offline")).unwrap();
        assert_eq!(payload["service"], "fieldlink");
        assert_eq!(payload["status"], "offline");
        assert!(payload["timestamp"].is_i64());
    }

    #[test]
    fn test_fail_all_drains_tracker() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        tracker.queued_subscribes.push_back(("a".to_string(), tx1));
        tracker.unsubscribes.insert(3, ("b".to_string(), tx2));

        tracker.fail_all(ConnectionState::Offline);
        assert!(tracker.queued_subscribes.is_empty());
        assert!(tracker.unsubscribes.is_empty());
        assert!(matches!(
            rx1.try_recv(),
            Ok(Err(GatewayError::NotConnected(ConnectionState::Offline)))
        ));
        assert!(rx2.try_recv().unwrap().is_err());
    }

    #[test]
    fn test_failed_request_does_not_claim_fresh_slot() {
        let mut tracker = AckTracker::default();
        let (stale_tx, mut stale_rx) = oneshot::channel();
        tracker.queued_subscribes.push_back(("resp/+".to_string(), stale_tx));
        tracker.fail_all(ConnectionState::Offline);
        assert!(stale_rx.try_recv().unwrap().is_err());

        // After reconnect a new request is queued while the failed one is
        // still in the client's channel ahead of it.
        let (fresh_tx, mut fresh_rx) = oneshot::channel();
        tracker.queued_subscribes.push_back(("register".to_string(), fresh_tx));

        assert_eq!(tracker.subscribe_sent(7), None);
        assert_eq!(tracker.subscribe_sent(8), Some("register".to_string()));
        assert!(!tracker.subscribes.contains_key(&7));

        let (pattern, responder) = tracker.subscribes.remove(&8).unwrap();
        assert_eq!(pattern, "register");
        responder.send(Ok(())).unwrap();
        assert!(fresh_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_outgoing_packets_pair_in_request_order() {
        let mut tracker = AckTracker::default();
        let (a_tx, _a_rx) = oneshot::channel();
        let (b_tx, _b_rx) = oneshot::channel();
        tracker.queued_unsubscribes.push_back(("a/#".to_string(), a_tx));
        tracker.queued_unsubscribes.push_back(("b/+".to_string(), b_tx));

        assert_eq!(tracker.unsubscribe_sent(1), Some("a/#".to_string()));
        assert_eq!(tracker.unsubscribe_sent(2), Some("b/+".to_string()));
        assert_eq!(tracker.unsubscribe_sent(3), None);
        assert_eq!(tracker.unsubscribes.len(), 2);
    }

    #[tokio::test]
    async fn test_operations_fail_fast_before_connack() {
        let settings = MqttSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_period_ms: 50,
            connect_timeout_secs: 1,
            ..Default::default()
        };
        let (manager, mut events) = ConnectionManager::initialize(&settings, "fieldlink");

        assert_eq!(
            events.recv().await,
            Some(ConnectionEvent::StateChanged(ConnectionState::Connecting))
        );
        let result = manager
            .publish("cmd/x", b"{}".to_vec(), PublishOptions::command())
            .await;
        assert!(matches!(result, Err(GatewayError::NotConnected(_))));
        assert!(manager.subscribe("resp/+").await.is_err());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
        // Closed is final.
        manager.shared.transition(ConnectionState::Connected);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
