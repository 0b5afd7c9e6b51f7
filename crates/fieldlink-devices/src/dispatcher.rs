//! Command dispatch and acknowledgment correlation.
//!
//! Every outbound command becomes a [`PendingCommand`] before it is published.
//! All transitions out of `Pending` (explicit ack, heuristic match, timeout,
//! reaper) go through [`CommandDispatcher::finish`] under the pending-map
//! lock: the entry is removed and its waiter notified in one critical
//! section, so the first path wins and every later one sees nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldlink_core::config::TopicSettings;
use fieldlink_core::{CommandStatus, GatewayEvent, SharedEventBus};
use fieldlink_storage::{GatewayStore, Record, RecordKind};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::topic::command_topic;
use crate::translator::{
    builtin_translators, generic_wire_command, CommandEnvelope, CommandTranslator, WireCommand,
};
use crate::transport::{PublishOptions, Transport};

/// One outstanding command awaiting acknowledgment.
#[derive(Debug)]
pub struct PendingCommand {
    pub id: String,
    pub target_id: String,
    pub kind: String,
    pub status: CommandStatus,
    /// Unix timestamp in milliseconds.
    pub sent_at: i64,
    pub acknowledged_at: Option<i64>,
    pub expected_action: Option<String>,
    pub expected_pin: Option<i64>,
    seq: u64,
    issued: Instant,
    waiter: Option<oneshot::Sender<CommandStatus>>,
}

impl PendingCommand {
    /// A waiter whose future was dropped no longer counts.
    fn has_live_waiter(&self) -> bool {
        self.waiter.as_ref().map_or(false, |w| !w.is_closed())
    }
}

/// Snapshot of a pending command for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingSummary {
    pub id: String,
    pub target_id: String,
    pub kind: String,
    pub sent_at: i64,
    pub has_waiter: bool,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub sent: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Builds, publishes and tracks device commands.
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    topics: TopicSettings,
    translators: RwLock<HashMap<String, Arc<dyn CommandTranslator>>>,
    pending: Mutex<HashMap<String, PendingCommand>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    counters: Counters,
    event_bus: Option<SharedEventBus>,
    store: Option<Arc<dyn GatewayStore>>,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, topics: TopicSettings) -> Self {
        Self {
            transport,
            topics,
            translators: RwLock::new(builtin_translators()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
            event_bus: None,
            store: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Commands and their results are appended to this store, and stored
    /// command topics take precedence over the default naming.
    pub fn with_store(mut self, store: Arc<dyn GatewayStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add or replace the translator for a command kind.
    pub fn register_translator(&self, kind: impl Into<String>, translator: Arc<dyn CommandTranslator>) {
        self.translators.write().insert(kind.into(), translator);
    }

    fn next_command_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("cmd_{}_{}", n, chrono::Utc::now().timestamp_millis())
    }

    fn target_topic(&self, target_id: &str) -> String {
        self.store
            .as_ref()
            .and_then(|store| store.load_device(target_id).ok().flatten())
            .and_then(|device| device.command_topic)
            .unwrap_or_else(|| command_topic(&self.topics, target_id))
    }

    /// Send a command and return its correlation id.
    ///
    /// The command is tracked before it is published so an immediate
    /// acknowledgment always finds it. A failed publish removes it again
    /// and surfaces the transport error.
    pub async fn send_command(&self, target_id: &str, kind: &str, data: Value) -> Result<String> {
        let envelope = CommandEnvelope {
            id: self.next_command_id(),
            kind: kind.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        let translator = self.translators.read().get(kind).cloned();
        let wire: WireCommand = match translator {
            Some(translator) => translator.translate(&envelope),
            None => generic_wire_command(&envelope),
        };
        let payload = serde_json::to_vec(&wire.payload)?;

        let id = envelope.id.clone();
        self.pending.lock().insert(
            id.clone(),
            PendingCommand {
                id: id.clone(),
                target_id: target_id.to_string(),
                kind: kind.to_string(),
                status: CommandStatus::Pending,
                sent_at: envelope.timestamp,
                acknowledged_at: None,
                expected_action: wire.expected_action,
                expected_pin: wire.expected_pin,
                seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                issued: Instant::now(),
                waiter: None,
            },
        );

        let topic = self.target_topic(target_id);
        if let Err(e) = self
            .transport
            .publish(&topic, payload, PublishOptions::command())
            .await
        {
            self.pending.lock().remove(&id);
            warn!(command_id = %id, device_id = %target_id, "Command publish rejected: {}", e);
            return Err(e);
        }

        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!(command_id = %id, device_id = %target_id, kind = %kind, topic = %topic, "Command sent");

        if let Some(bus) = &self.event_bus {
            bus.publish(GatewayEvent::CommandSent {
                command_id: id.clone(),
                device_id: target_id.to_string(),
                kind: kind.to_string(),
            });
        }
        self.record(
            target_id,
            RecordKind::Command,
            json!({ "id": id, "type": kind, "payload": wire.payload }),
        );

        Ok(id)
    }

    /// Block until the command leaves `Pending` or the timeout elapses.
    ///
    /// Returns `true` only for `Acknowledged`. Unknown or already resolved
    /// ids return `false` at once, as does a second waiter on the same id.
    /// Dropping this future before it completes detaches the waiter, leaving
    /// the command to a later waiter or to the reaper.
    /// On timeout the command becomes `TimedOut` unless an acknowledgment won
    /// the race, in which case that outcome is reported.
    pub async fn wait_for_ack(&self, command_id: &str, timeout: Duration) -> bool {
        let mut rx = {
            let mut pending = self.pending.lock();
            let Some(command) = pending.get_mut(command_id) else {
                debug!(command_id = %command_id, "wait_for_ack on unknown or resolved command");
                return false;
            };
            if command.has_live_waiter() {
                warn!(command_id = %command_id, "Command already has a waiter");
                return false;
            }
            let (tx, rx) = oneshot::channel();
            command.waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(status)) => status == CommandStatus::Acknowledged,
            Ok(Err(_)) => false,
            Err(_) => {
                if self.finish(command_id, CommandStatus::TimedOut) {
                    info!(
                        command_id = %command_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Command timed out"
                    );
                    false
                } else {
                    matches!(rx.try_recv(), Ok(CommandStatus::Acknowledged))
                }
            }
        }
    }

    /// Resolve a command by its echoed correlation id.
    pub fn resolve(&self, command_id: &str, success: bool) -> bool {
        let status = if success {
            CommandStatus::Acknowledged
        } else {
            CommandStatus::Failed
        };
        let resolved = self.finish(command_id, status);
        if !resolved {
            debug!(command_id = %command_id, "Acknowledgment for unknown or resolved command");
        }
        resolved
    }

    /// Resolve the oldest pending command for a device whose expected action
    /// and pin match a firmware response that carries no correlation id.
    ///
    /// With several same-action commands in flight for one pin the oldest is
    /// picked, which may not be the one the device actually answered.
    pub fn resolve_by_action(
        &self,
        target_id: &str,
        action: &str,
        pin: Option<i64>,
        success: bool,
    ) -> Option<String> {
        let status = if success {
            CommandStatus::Acknowledged
        } else {
            CommandStatus::Failed
        };

        let resolved = {
            let mut pending = self.pending.lock();
            let candidate = pending
                .values()
                .filter(|c| c.target_id == target_id)
                .filter(|c| c.expected_action.as_deref() == Some(action))
                .filter(|c| match (c.expected_pin, pin) {
                    (Some(expected), Some(actual)) => expected == actual,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .min_by_key(|c| c.seq)
                .map(|c| c.id.clone());
            candidate.and_then(|id| Self::finish_locked(&mut pending, &id, status))
        };

        match resolved {
            Some(command) => {
                let id = command.id.clone();
                self.after_finish(command);
                Some(id)
            }
            None => {
                debug!(device_id = %target_id, action = %action, "Firmware response matched no pending command");
                None
            }
        }
    }

    /// Time out commands with no live waiter once they exceed `ttl`.
    pub fn expire_stale(&self, ttl: Duration) -> usize {
        let expired: Vec<PendingCommand> = {
            let mut pending = self.pending.lock();
            let stale: Vec<String> = pending
                .values()
                .filter(|c| !c.has_live_waiter() && c.issued.elapsed() >= ttl)
                .map(|c| c.id.clone())
                .collect();
            stale
                .iter()
                .filter_map(|id| Self::finish_locked(&mut pending, id, CommandStatus::TimedOut))
                .collect()
        };

        let count = expired.len();
        for command in expired {
            self.after_finish(command);
        }
        if count > 0 {
            info!("Expired {} unacknowledged commands", count);
        }
        count
    }

    pub fn is_pending(&self, command_id: &str) -> bool {
        self.pending.lock().contains_key(command_id)
    }

    /// In-flight commands, oldest first.
    pub fn pending_commands(&self) -> Vec<PendingSummary> {
        let pending = self.pending.lock();
        let mut list: Vec<(u64, PendingSummary)> = pending
            .values()
            .map(|c| {
                (
                    c.seq,
                    PendingSummary {
                        id: c.id.clone(),
                        target_id: c.target_id.clone(),
                        kind: c.kind.clone(),
                        sent_at: c.sent_at,
                        has_waiter: c.has_live_waiter(),
                    },
                )
            })
            .collect();
        list.sort_by_key(|(seq, _)| *seq);
        list.into_iter().map(|(_, summary)| summary).collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            in_flight: self.pending.lock().len(),
        }
    }

    /// Single transition point: remove, mark terminal, notify the waiter.
    fn finish(&self, command_id: &str, status: CommandStatus) -> bool {
        let command = {
            let mut pending = self.pending.lock();
            Self::finish_locked(&mut pending, command_id, status)
        };
        match command {
            Some(command) => {
                self.after_finish(command);
                true
            }
            None => false,
        }
    }

    fn finish_locked(
        pending: &mut HashMap<String, PendingCommand>,
        command_id: &str,
        status: CommandStatus,
    ) -> Option<PendingCommand> {
        let mut command = pending.remove(command_id)?;
        command.status = status;
        if status == CommandStatus::Acknowledged {
            command.acknowledged_at = Some(chrono::Utc::now().timestamp_millis());
        }
        if let Some(waiter) = command.waiter.take() {
            let _ = waiter.send(status);
        }
        Some(command)
    }

    fn after_finish(&self, command: PendingCommand) {
        let counter = match command.status {
            CommandStatus::Acknowledged => &self.counters.acknowledged,
            CommandStatus::Failed => &self.counters.failed,
            _ => &self.counters.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        debug!(
            command_id = %command.id,
            device_id = %command.target_id,
            status = command.status.as_str(),
            "Command resolved"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(GatewayEvent::CommandResolved {
                command_id: command.id.clone(),
                device_id: command.target_id.clone(),
                status: command.status,
            });
        }
        self.record(
            &command.target_id,
            RecordKind::CommandResult,
            json!({
                "id": command.id,
                "type": command.kind,
                "status": command.status.as_str(),
                "sent_at": command.sent_at,
                "acknowledged_at": command.acknowledged_at,
            }),
        );
    }

    fn record(&self, device_id: &str, kind: RecordKind, data: Value) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(Record::new(device_id, kind, data)) {
                warn!(device_id = %device_id, "Failed to record command history: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use crate::GatewayError;
    use fieldlink_core::{ConnectionState, EventBus};
    use fieldlink_storage::{DeviceRecord, DeviceStore, MemoryStore, RecordStore};

    fn dispatcher() -> (Arc<MockTransport>, Arc<CommandDispatcher>) {
        let transport = MockTransport::connected();
        let dispatcher = CommandDispatcher::new(transport.clone(), TopicSettings::default());
        (transport, Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_send_command_publishes_translated_payload() {
        let (transport, dispatcher) = dispatcher();
        let id = dispatcher
            .send_command("board1", "gpio", json!({"pin": 2, "state": "on"}))
            .await
            .unwrap();

        assert!(id.starts_with("cmd_1_"));
        let sent = transport.published_to("cmd/board1");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].options, PublishOptions::command());
        let payload = sent[0].json().unwrap();
        assert_eq!(payload["id"], id.as_str());
        assert_eq!(payload["action"], "gpio");
        assert!(dispatcher.is_pending(&id));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (_transport, dispatcher) = dispatcher();
        let a = dispatcher.send_command("b", "restart", json!({})).await.unwrap();
        let b = dispatcher.send_command("b", "restart", json!({})).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_publish_failure_removes_pending() {
        let (transport, _rx) = MockTransport::new();
        transport.set_state(ConnectionState::Offline);
        let dispatcher = CommandDispatcher::new(transport, TopicSettings::default());

        let result = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await;
        assert!(matches!(result, Err(GatewayError::NotConnected(ConnectionState::Offline))));
        assert_eq!(dispatcher.stats().in_flight, 0);
        assert_eq!(dispatcher.stats().sent, 0);
    }

    #[tokio::test]
    async fn test_explicit_ack_wakes_waiter() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            tokio::spawn(async move { dispatcher.wait_for_ack(&id, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        assert!(dispatcher.resolve(&id, true));
        assert!(waiter.await.unwrap());
        assert!(!dispatcher.resolve(&id, true));
        assert_eq!(dispatcher.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_failed_ack_returns_false() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "restart", json!({})).await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            tokio::spawn(async move { dispatcher.wait_for_ack(&id, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        dispatcher.resolve(&id, false);
        assert!(!waiter.await.unwrap());
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_unknown_id_returns_false_immediately() {
        let (_transport, dispatcher) = dispatcher();
        assert!(!dispatcher.wait_for_ack("cmd_404_0", Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn test_ack_before_wait_reports_resolved() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();
        dispatcher.resolve(&id, true);
        // Already resolved: no longer pending.
        assert!(!dispatcher.wait_for_ack(&id, Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_transitions_to_timed_out() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        assert!(!dispatcher.wait_for_ack(&id, Duration::from_millis(10_000)).await);
        assert!(!dispatcher.is_pending(&id));
        assert_eq!(dispatcher.stats().timed_out, 1);

        // Late acknowledgments are no-ops.
        assert!(!dispatcher.resolve(&id, true));
        assert_eq!(dispatcher.resolve_by_action("board1", "gpio", Some(2), true), None);
        assert_eq!(dispatcher.stats().acknowledged, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_waiter_returns_false() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        let first = {
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            tokio::spawn(async move { dispatcher.wait_for_ack(&id, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        assert!(!dispatcher.wait_for_ack(&id, Duration::from_secs(10)).await);
        assert!(dispatcher.is_pending(&id));

        dispatcher.resolve(&id, true);
        assert!(first.await.unwrap());
    }

    #[tokio::test]
    async fn test_heuristic_match_by_action_and_pin() {
        let (_transport, dispatcher) = dispatcher();
        let pin2 = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();
        let pin4 = dispatcher.send_command("board1", "gpio", json!({"pin": 4})).await.unwrap();
        let other = dispatcher.send_command("board2", "gpio", json!({"pin": 4})).await.unwrap();

        assert_eq!(
            dispatcher.resolve_by_action("board1", "gpio", Some(4), true),
            Some(pin4.clone())
        );
        assert!(dispatcher.is_pending(&pin2));
        assert!(dispatcher.is_pending(&other));
        assert_eq!(dispatcher.resolve_by_action("board1", "pwm", Some(2), true), None);
        assert_eq!(dispatcher.resolve_by_action("board1", "gpio", None, true), None);
    }

    #[tokio::test]
    async fn test_heuristic_picks_oldest_of_ambiguous_commands() {
        let (_transport, dispatcher) = dispatcher();
        let first = dispatcher.send_command("board1", "gpio", json!({"pin": 2, "state": "on"})).await.unwrap();
        let second = dispatcher.send_command("board1", "gpio", json!({"pin": 2, "state": "off"})).await.unwrap();

        assert_eq!(dispatcher.resolve_by_action("board1", "gpio", Some(2), true), Some(first));
        assert_eq!(dispatcher.resolve_by_action("board1", "gpio", Some(2), true), Some(second));
    }

    #[tokio::test]
    async fn test_explicit_then_heuristic_is_noop() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        assert!(dispatcher.resolve(&id, true));
        assert_eq!(dispatcher.resolve_by_action("board1", "gpio", Some(2), false), None);
        let stats = dispatcher.stats();
        assert_eq!((stats.acknowledged, stats.failed), (1, 0));
    }

    #[tokio::test]
    async fn test_custom_translator() {
        struct Relay;
        impl CommandTranslator for Relay {
            fn translate(&self, envelope: &CommandEnvelope) -> WireCommand {
                WireCommand {
                    payload: json!({"id": envelope.id, "action": "relay_toggle", "ch": envelope.data["channel"]}),
                    expected_action: Some("relay_toggle".to_string()),
                    expected_pin: None,
                }
            }
        }

        let (transport, dispatcher) = dispatcher();
        dispatcher.register_translator("relay", Arc::new(Relay));
        let id = dispatcher.send_command("board1", "relay", json!({"channel": 1})).await.unwrap();

        assert_eq!(transport.last_published_json("cmd/board1").unwrap()["ch"], 1);
        assert_eq!(
            dispatcher.resolve_by_action("board1", "relay_toggle", Some(9), true),
            Some(id)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_skips_waited_commands() {
        let (_transport, dispatcher) = dispatcher();
        let orphan = dispatcher.send_command("board1", "restart", json!({})).await.unwrap();
        let waited = dispatcher.send_command("board1", "gpio", json!({"pin": 1})).await.unwrap();

        let waiter = {
            let dispatcher = dispatcher.clone();
            let id = waited.clone();
            tokio::spawn(async move { dispatcher.wait_for_ack(&id, Duration::from_secs(600)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(dispatcher.expire_stale(Duration::from_secs(300)), 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(dispatcher.expire_stale(Duration::from_secs(300)), 1);
        assert!(!dispatcher.is_pending(&orphan));
        assert!(dispatcher.is_pending(&waited));

        dispatcher.resolve(&waited, true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_is_detached() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            dispatcher.wait_for_ack(&id, Duration::from_secs(10)),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(dispatcher.is_pending(&id));
        assert!(!dispatcher.pending_commands()[0].has_waiter);

        // A fresh waiter can attach after the first one went away.
        let waiter = {
            let dispatcher = dispatcher.clone();
            let id = id.clone();
            tokio::spawn(async move { dispatcher.wait_for_ack(&id, Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;
        assert!(dispatcher.pending_commands()[0].has_waiter);
        dispatcher.resolve(&id, true);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_command_after_waiter_cancelled() {
        let (_transport, dispatcher) = dispatcher();
        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();

        let _ = tokio::time::timeout(
            Duration::from_millis(5),
            dispatcher.wait_for_ack(&id, Duration::from_secs(10)),
        )
        .await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(dispatcher.expire_stale(Duration::from_secs(300)), 1);
        assert!(!dispatcher.is_pending(&id));
        let stats = dispatcher.stats();
        assert_eq!((stats.timed_out, stats.in_flight), (1, 0));
    }

    #[tokio::test]
    async fn test_pending_commands_in_send_order() {
        let (_transport, dispatcher) = dispatcher();
        let first = dispatcher.send_command("board1", "restart", json!({})).await.unwrap();
        let second = dispatcher.send_command("board2", "gpio", json!({"pin": 5})).await.unwrap();

        let pending = dispatcher.pending_commands();
        let ids: Vec<&str> = pending.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str()]);
        assert_eq!(pending[1].target_id, "board2");
        assert_eq!(pending[1].kind, "gpio");
        assert!(!pending[0].has_waiter);
    }

    #[tokio::test]
    async fn test_history_and_events() {
        let transport = MockTransport::connected();
        let store = Arc::new(MemoryStore::new());
        store
            .save_device(&DeviceRecord {
                device_id: "board1".to_string(),
                command_topic: Some("legacy/board1/in".to_string()),
                ..Default::default()
            })
            .unwrap();
        let bus = Arc::new(EventBus::new());
        let mut events = bus.command_events();

        let dispatcher = CommandDispatcher::new(transport.clone(), TopicSettings::default())
            .with_event_bus(bus.clone())
            .with_store(store.clone());

        let id = dispatcher.send_command("board1", "gpio", json!({"pin": 2})).await.unwrap();
        assert_eq!(transport.published_to("legacy/board1/in").len(), 1);
        dispatcher.resolve(&id, true);

        let (sent, _) = events.recv().await.unwrap();
        assert!(matches!(sent, GatewayEvent::CommandSent { .. }));
        let (resolved, _) = events.recv().await.unwrap();
        assert_eq!(
            resolved,
            GatewayEvent::CommandResolved {
                command_id: id.clone(),
                device_id: "board1".to_string(),
                status: CommandStatus::Acknowledged,
            }
        );

        let history = store.recent("board1", None, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, RecordKind::CommandResult);
        assert_eq!(history[0].data["status"], "acknowledged");
        assert_eq!(history[1].kind, RecordKind::Command);
    }
}
