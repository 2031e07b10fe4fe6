//! In-memory broker for testing and single-process scenarios.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::routing::RoutingDescriptor;
use crate::transport::{BrokerChannel, BrokerConnector, ChannelError, Confirmation, ConnectError};

/// A message as it arrived at the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl PublishedMessage {
    /// Parse the body as JSON. Panics on a non-JSON body; only meant for
    /// test assertions against the envelope.
    pub fn body_json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("published body is not valid JSON")
    }
}

#[derive(Default)]
struct BrokerInner {
    up: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    /// Routing keys the broker will Nack, for failure scripting.
    rejected_keys: Mutex<HashSet<String>>,
    /// Number of upcoming publishes that fail with a closed channel.
    fail_publishes: AtomicUsize,
}

/// Broker that keeps published messages in memory.
///
/// Thread-safe and cloneable; clones share the same state, so a test can hold
/// one handle for scripting (take the broker down, reject a routing key) while
/// the gateway holds another for publishing.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a broker that is up and accepting connections.
    pub fn new() -> Self {
        let inner = BrokerInner::default();
        inner.up.store(true, Ordering::SeqCst);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create a broker that refuses connections until [`bring_up`](Self::bring_up).
    pub fn down() -> Self {
        Self {
            inner: Arc::new(BrokerInner::default()),
        }
    }

    /// Stop accepting connections and fail open channels on next use.
    pub fn take_down(&self) {
        self.inner.up.store(false, Ordering::SeqCst);
    }

    /// Start accepting connections again.
    pub fn bring_up(&self) {
        self.inner.up.store(true, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.inner.up.load(Ordering::SeqCst)
    }

    /// Nack every publish with this routing key until cleared.
    pub fn reject_routing_key(&self, key: impl Into<String>) {
        self.inner.rejected_keys.lock().unwrap().insert(key.into());
    }

    pub fn clear_rejections(&self) {
        self.inner.rejected_keys.lock().unwrap().clear();
    }

    /// Fail the next `n` publishes with a closed-channel error.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.fail_publishes.store(n, Ordering::SeqCst);
    }

    /// Everything successfully published so far, in arrival order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner.published.lock().unwrap().clone()
    }

    /// Messages that arrived under the given routing key, in order.
    pub fn published_with_key(&self, key: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.routing_key == key)
            .collect()
    }
}

impl BrokerConnector for InMemoryBroker {
    type Channel = InMemoryChannel;

    fn connect(&self) -> Result<Self::Channel, ConnectError> {
        if !self.is_up() {
            return Err(ConnectError::new("broker is down"));
        }
        Ok(InMemoryChannel {
            inner: Arc::clone(&self.inner),
        })
    }
}

/// Channel handed out by [`InMemoryBroker`].
pub struct InMemoryChannel {
    inner: Arc<BrokerInner>,
}

impl BrokerChannel for InMemoryChannel {
    fn publish(
        &mut self,
        routing: &RoutingDescriptor,
        body: &[u8],
        _timeout: Duration,
    ) -> Result<Confirmation, ChannelError> {
        if !self.inner.up.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed("connection reset".to_string()));
        }
        if self
            .inner
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ChannelError::Closed("channel dropped".to_string()));
        }
        if self
            .inner
            .rejected_keys
            .lock()
            .map_err(|_| ChannelError::Closed("broker state poisoned".to_string()))?
            .contains(&routing.routing_key)
        {
            return Ok(Confirmation::Nack(Some("rejected by broker".to_string())));
        }
        self.inner
            .published
            .lock()
            .map_err(|_| ChannelError::Closed("broker state poisoned".to_string()))?
            .push(PublishedMessage {
                exchange: routing.exchange.clone(),
                routing_key: routing.routing_key.clone(),
                body: body.to_vec(),
            });
        Ok(Confirmation::Ack)
    }
}
