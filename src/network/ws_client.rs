//! WebSocket broadcaster.
//!
//! `Broadcaster` backed by a relay connection. A writer task drains an
//! outgoing queue into the socket; a reader task turns `event` frames into
//! envelopes on a local channel that subscriptions read from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::game::events::BroadcastEvent;
use crate::network::broadcast::{BroadcastError, Broadcaster, ClientId, Envelope, Subscription, CHANNEL_CAPACITY};
use crate::network::protocol::{ErrorCode, RelayClientMessage, RelayServerMessage};

/// How long a subscribe waits for the relay's answer.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A subscribe waiting for the relay's answer.
struct PendingAck {
    request: u64,
    topic: String,
    ack: oneshot::Sender<Result<(), String>>,
}

type PendingAcks = Arc<Mutex<VecDeque<PendingAck>>>;

/// Take the entry an answer belongs to. Answers naming a topic go to the
/// oldest request for that topic; untagged ones to the oldest request.
fn take_pending(queue: &mut VecDeque<PendingAck>, topic: Option<&str>) -> Option<PendingAck> {
    match topic {
        Some(topic) => {
            let idx = queue.iter().position(|p| p.topic == topic)?;
            queue.remove(idx)
        }
        None => queue.pop_front(),
    }
}

/// Relay client.
pub struct WsBroadcaster {
    id: ClientId,
    token: Option<String>,
    outgoing: mpsc::Sender<RelayClientMessage>,
    incoming: broadcast::Sender<Envelope>,
    pending: PendingAcks,
    next_request: AtomicU64,
    subscribe_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsBroadcaster {
    /// Connect to a relay. `token` is presented on every subscribe.
    pub async fn connect(url: &str, token: Option<String>) -> Result<Self, BroadcastError> {
        info!("Connecting to relay {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<RelayClientMessage>(100);
        let (incoming, _) = broadcast::channel::<Envelope>(CHANNEL_CAPACITY);
        let pending: PendingAcks = Arc::new(Mutex::new(VecDeque::new()));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    error!("Failed to send relay frame: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Relay writer ended");
        });

        let reader_incoming = incoming.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match RelayServerMessage::from_json(&text) {
                        Ok(msg) => Self::handle_server_message(msg, &reader_incoming, &reader_pending).await,
                        Err(e) => warn!("Failed to parse relay frame: {} - {}", e, text),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Relay closed connection");
                        break;
                    }
                    Err(e) => {
                        error!("Relay read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            // fail anyone still waiting on an ack
            for waiting in reader_pending.lock().await.drain(..) {
                let _ = waiting
                    .ack
                    .send(Err(format!("connection closed before {} was acknowledged", waiting.topic)));
            }
            debug!("Relay reader ended");
        });

        Ok(Self {
            id: ClientId::generate(),
            token,
            outgoing,
            incoming,
            pending,
            next_request: AtomicU64::new(0),
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            reader,
            writer,
        })
    }

    /// Override how long a subscribe waits for its answer.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    async fn handle_server_message(msg: RelayServerMessage, incoming: &broadcast::Sender<Envelope>, pending: &PendingAcks) {
        match msg {
            RelayServerMessage::Event { topic, origin, event } => {
                // nobody listening is fine
                let _ = incoming.send(Envelope { topic, origin, event });
            }
            RelayServerMessage::Subscribed { topic } => match take_pending(&mut *pending.lock().await, Some(&topic)) {
                Some(waiting) => {
                    let _ = waiting.ack.send(Ok(()));
                }
                None => debug!(%topic, "Late subscribe ack, nobody waiting"),
            },
            RelayServerMessage::Error(err) => match err.code {
                ErrorCode::Unauthorized | ErrorCode::TokenExpired | ErrorCode::InvalidTopic => {
                    match take_pending(&mut *pending.lock().await, err.topic.as_deref()) {
                        Some(waiting) => {
                            let _ = waiting.ack.send(Err(err.message));
                        }
                        None => debug!(code = ?err.code, "Late subscribe rejection, nobody waiting"),
                    }
                }
                _ => warn!("Relay error {:?}: {}", err.code, err.message),
            },
            RelayServerMessage::Pong { timestamp, server_time } => {
                debug!(timestamp, server_time, "Relay pong");
            }
        }
    }

    async fn send(&self, msg: RelayClientMessage) -> Result<(), BroadcastError> {
        self.outgoing.send(msg).await.map_err(|_| BroadcastError::Closed)
    }

    /// Drop a request that will not wait any longer.
    async fn abandon(&self, request: u64) {
        self.pending.lock().await.retain(|p| p.request != request);
    }

    /// Send a latency check.
    pub async fn ping(&self) -> Result<(), BroadcastError> {
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.send(RelayClientMessage::Ping { timestamp }).await
    }

    /// Stop receiving a topic.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BroadcastError> {
        self.send(RelayClientMessage::Unsubscribe { topic: topic.to_string() }).await
    }
}

impl Drop for WsBroadcaster {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[async_trait]
impl Broadcaster for WsBroadcaster {
    fn client_id(&self) -> ClientId {
        self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BroadcastError> {
        // receiver first, so nothing arriving right after the ack is missed
        let rx = self.incoming.subscribe();
        let (ack, ack_rx) = oneshot::channel();
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().await.push_back(PendingAck { request, topic: topic.to_string(), ack });

        let sent = self
            .send(RelayClientMessage::Subscribe {
                topic: topic.to_string(),
                token: self.token.clone(),
            })
            .await;
        if let Err(e) = sent {
            self.abandon(request).await;
            return Err(e);
        }

        match tokio::time::timeout(self.subscribe_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(topic, "Subscribed via relay");
                Ok(Subscription::new(topic, self.id, rx))
            }
            Ok(Ok(Err(reason))) => Err(BroadcastError::Rejected(reason)),
            Ok(Err(_)) => Err(BroadcastError::Closed),
            Err(_) => {
                self.abandon(request).await;
                Err(BroadcastError::Transport(format!("subscribe to {topic} timed out")))
            }
        }
    }

    async fn publish(&self, topic: &str, event: BroadcastEvent) -> Result<(), BroadcastError> {
        self.send(RelayClientMessage::Publish {
            topic: topic.to_string(),
            origin: self.id,
            event,
        })
        .await
    }
}
