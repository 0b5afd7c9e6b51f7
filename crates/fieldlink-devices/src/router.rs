//! Topic router: one handler per inbound message.
//!
//! Exact patterns are looked up directly. Wildcard patterns are kept sorted
//! by specificity and, at equal specificity, by registration order, so the
//! handler chosen for a topic never depends on map iteration order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::topic::{is_wildcard, specificity, topic_matches, validate_pattern};
use crate::transport::Transport;

/// Business logic attached to a subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

struct WildcardRoute {
    pattern: String,
    seq: u64,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct RouteTable {
    exact: HashMap<String, (u64, Arc<dyn MessageHandler>)>,
    wildcards: Vec<WildcardRoute>,
    next_seq: u64,
}

impl RouteTable {
    fn insert(&mut self, pattern: &str, handler: Arc<dyn MessageHandler>) {
        if is_wildcard(pattern) {
            if let Some(route) = self.wildcards.iter_mut().find(|r| r.pattern == pattern) {
                route.handler = handler;
                return;
            }
            let seq = self.bump();
            self.wildcards.push(WildcardRoute {
                pattern: pattern.to_string(),
                seq,
                handler,
            });
            self.wildcards.sort_by(|a, b| {
                specificity(&b.pattern)
                    .cmp(&specificity(&a.pattern))
                    .then(a.seq.cmp(&b.seq))
            });
        } else {
            let seq = match self.exact.get(pattern) {
                Some((seq, _)) => *seq,
                None => self.bump(),
            };
            self.exact.insert(pattern.to_string(), (seq, handler));
        }
    }

    fn remove(&mut self, pattern: &str) -> bool {
        if self.exact.remove(pattern).is_some() {
            return true;
        }
        let before = self.wildcards.len();
        self.wildcards.retain(|r| r.pattern != pattern);
        before != self.wildcards.len()
    }

    fn lookup(&self, topic: &str) -> Option<Arc<dyn MessageHandler>> {
        if let Some((_, handler)) = self.exact.get(topic) {
            return Some(handler.clone());
        }
        self.wildcards
            .iter()
            .find(|r| topic_matches(&r.pattern, topic))
            .map(|r| r.handler.clone())
    }

    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Maps inbound topics to handlers and owns the set of active subscriptions.
pub struct TopicRouter {
    transport: Arc<dyn Transport>,
    routes: RwLock<RouteTable>,
}

impl TopicRouter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            routes: RwLock::new(RouteTable::default()),
        }
    }

    /// Subscribe to a pattern and attach its handler.
    ///
    /// The route is recorded only after the broker confirms. While not
    /// connected nothing is recorded and `NotConnected` is returned.
    /// Subscribing an already routed pattern replaces its handler.
    pub async fn subscribe(&self, pattern: &str, handler: Arc<dyn MessageHandler>) -> Result<()> {
        validate_pattern(pattern)?;

        let state = self.transport.state();
        if !self.transport.is_connected() {
            warn!("Ignoring subscribe to {} while {}", pattern, state);
            return Err(GatewayError::NotConnected(state));
        }

        self.transport.subscribe(pattern).await?;
        self.routes.write().insert(pattern, handler);
        info!(topic = %pattern, "Subscribed");
        Ok(())
    }

    /// Remove a subscription. The route is dropped only after the broker confirms.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.transport.unsubscribe(pattern).await?;
        if self.routes.write().remove(pattern) {
            info!(topic = %pattern, "Unsubscribed");
        } else {
            debug!(topic = %pattern, "Unsubscribed pattern had no route");
        }
        Ok(())
    }

    /// Run the best-matching handler for a message. Returns whether one ran.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> bool {
        let handler = self.routes.read().lookup(topic);
        match handler {
            Some(handler) => {
                handler.handle(topic, payload).await;
                true
            }
            None => {
                debug!(topic = %topic, "No route for inbound message");
                false
            }
        }
    }

    /// Reissue every recorded subscription, e.g. after a reconnect.
    ///
    /// Routes stay recorded even if the broker refuses one; returns how many
    /// were confirmed.
    pub async fn resubscribe_all(&self) -> usize {
        let patterns = self.patterns();
        let mut confirmed = 0;
        for pattern in &patterns {
            match self.transport.subscribe(pattern).await {
                Ok(()) => confirmed += 1,
                Err(e) => warn!("Resubscribe to {} failed: {}", pattern, e),
            }
        }
        if !patterns.is_empty() {
            info!("Resubscribed {}/{} topics", confirmed, patterns.len());
        }
        confirmed
    }

    pub fn has_route(&self, pattern: &str) -> bool {
        let routes = self.routes.read();
        routes.exact.contains_key(pattern) || routes.wildcards.iter().any(|r| r.pattern == pattern)
    }

    /// Whether some recorded route would receive messages on `topic`.
    pub fn is_covered(&self, topic: &str) -> bool {
        self.routes.read().lookup(topic).is_some()
    }

    /// Recorded patterns: exact ones by registration order, then wildcards in match order.
    pub fn patterns(&self) -> Vec<String> {
        let routes = self.routes.read();
        let mut exact: Vec<(u64, String)> = routes
            .exact
            .iter()
            .map(|(pattern, (seq, _))| (*seq, pattern.clone()))
            .collect();
        exact.sort();
        exact
            .into_iter()
            .map(|(_, pattern)| pattern)
            .chain(routes.wildcards.iter().map(|r| r.pattern.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        let routes = self.routes.read();
        routes.exact.len() + routes.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
