//! Broadcast Channel
//!
//! Fire-and-forget fan-out of session events. Delivery is at-most-once with no
//! ordering across publishers: a lagging receiver silently loses events, and a
//! publisher never receives its own events back.
//!
//! `LocalHub` is the in-process transport; `WsBroadcaster` in `ws_client`
//! talks to the relay. Both hand out the same `Subscription` type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::game::events::BroadcastEvent;

/// Per-topic channel capacity.
pub const CHANNEL_CAPACITY: usize = 256;

/// Identity of one broadcast participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An event in flight.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Topic it was published on
    pub topic: String,
    /// Publisher
    pub origin: ClientId,
    /// Payload
    pub event: BroadcastEvent,
}

/// Broadcast failures.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// Transport shut down.
    #[error("broadcast channel closed")]
    Closed,

    /// Frame could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Relay refused a request.
    #[error("relay rejected request: {0}")]
    Rejected(String),

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// This participant's id.
    fn client_id(&self) -> ClientId;

    /// Start receiving a topic. Events published before this call are not seen.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BroadcastError>;

    /// Publish to every other subscriber of a topic.
    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), BroadcastError>;
}

/// Receiving end of one topic. Drops the owner's own events.
pub struct Subscription {
    topic: String,
    origin: ClientId,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Wrap a receiver.
    pub fn new(topic: impl Into<String>, origin: ClientId, rx: broadcast::Receiver<Envelope>) -> Self {
        Self { topic: topic.into(), origin, rx }
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn accept(&self, envelope: &Envelope) -> bool {
        envelope.origin != self.origin && envelope.topic == self.topic
    }

    /// Next event from another participant. `None` once the channel closed.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if self.accept(&envelope) => return Some(envelope.event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscription lagged, events lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next queued event, without waiting.
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if self.accept(&envelope) => return Some(envelope.event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "Subscription lagged, events lost");
                }
                Err(_) => return None,
            }
        }
    }
}

// =============================================================================
// IN-PROCESS HUB
// =============================================================================

struct HubInner {
    topics: RwLock<BTreeMap<String, broadcast::Sender<Envelope>>>,
    dropping: AtomicBool,
}

/// In-process broadcast hub shared by several clients.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: RwLock::new(BTreeMap::new()),
                dropping: AtomicBool::new(false),
            }),
        }
    }

    /// A participant with a fresh id.
    pub fn client(&self) -> HubClient {
        HubClient { hub: self.clone(), id: ClientId::generate() }
    }

    /// While set, every publish is silently lost.
    pub fn set_dropping(&self, dropping: bool) {
        self.inner.dropping.store(dropping, Ordering::SeqCst);
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Envelope> {
        if let Some(tx) = self.inner.topics.read().await.get(topic) {
            return tx.clone();
        }
        let mut topics = self.inner.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver an envelope to every subscriber of its topic.
    pub async fn deliver(&self, envelope: Envelope) {
        if self.inner.dropping.load(Ordering::SeqCst) {
            debug!(topic = %envelope.topic, kind = envelope.event.kind().as_str(), "Hub dropping event");
            return;
        }
        let tx = self.sender(&envelope.topic).await;
        // no receivers is not an error for fire-and-forget delivery
        let receivers = tx.send(envelope).unwrap_or(0);
        debug!(receivers, "Hub delivered event");
    }
}

/// One participant of a `LocalHub`.
#[derive(Clone)]
pub struct HubClient {
    hub: LocalHub,
    id: ClientId,
}

#[async_trait]
impl Broadcaster for HubClient {
    fn client_id(&self) -> ClientId {
        self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BroadcastError> {
        let rx = self.hub.sender(topic).await.subscribe();
        Ok(Subscription::new(topic, self.id, rx))
    }

    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), BroadcastError> {
        self.hub
            .deliver(Envelope { topic: topic.to_string(), origin: self.id, event })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Game, GameId};

    fn event() -> BroadcastEvent {
        BroadcastEvent::GameUpdated { game: Game::new(GameId::new("ABCD1234"), false) }
    }

    #[tokio::test]
    async fn test_fan_out_without_echo() {
        let hub = LocalHub::new();
        let a = hub.client();
        let b = hub.client();
        let mut sub_a = a.subscribe("game:ABCD1234").await.unwrap();
        let mut sub_b = b.subscribe("game:ABCD1234").await.unwrap();

        a.publish("game:ABCD1234", event()).await.unwrap();
        assert_eq!(sub_b.recv().await, Some(event()));
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = LocalHub::new();
        let a = hub.client();
        let b = hub.client();
        let mut sub_b = b.subscribe("game:OTHER").await.unwrap();
        a.publish("game:ABCD1234", event()).await.unwrap();
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_loses_events() {
        let hub = LocalHub::new();
        let a = hub.client();
        let b = hub.client();
        let mut sub_b = b.subscribe("t").await.unwrap();

        hub.set_dropping(true);
        a.publish("t", event()).await.unwrap();
        assert!(sub_b.try_recv().is_none());

        hub.set_dropping(false);
        a.publish("t", event()).await.unwrap();
        assert!(sub_b.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = LocalHub::new();
        assert!(hub.client().publish("empty", event()).await.is_ok());
    }
}
