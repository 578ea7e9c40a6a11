//! WebSocket Broadcast Relay
//!
//! Fans `publish` frames out to the other subscribers of a topic. The relay
//! keeps no game state: no persistence, no replay, no ordering beyond what a
//! single connection delivers. A full client queue drops the frame.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::network::identity::{IdentityConfig, IdentityError, SeatTokenIssuer};
use crate::network::protocol::{topic_game_id, ErrorCode, RelayClientMessage, RelayServerMessage};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Connection limit.
    pub max_connections: usize,
    /// Connections silent for longer are dropped.
    pub idle_timeout: Duration,
    /// How often idle connections are swept.
    pub cleanup_interval: Duration,
    /// Outbound frames buffered per connection.
    pub queue_capacity: usize,
    /// Require a valid seat token on subscribe.
    pub require_tokens: bool,
    /// Token settings, used when `require_tokens` is set.
    pub identity: IdentityConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            queue_capacity: 64,
            require_tokens: false,
            identity: IdentityConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("BINGO_RELAY_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            max_connections: std::env::var("BINGO_RELAY_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            idle_timeout: std::env::var("BINGO_RELAY_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            require_tokens: std::env::var("BINGO_RELAY_REQUIRE_TOKENS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            identity: IdentityConfig::from_env(),
            ..defaults
        }
    }
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Listener could not be bound.
    #[error("cannot bind relay listener: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Handshake or socket failure.
    #[error("relay socket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Tokens required but not configured.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Per-connection bookkeeping.
struct RelayClient {
    /// Topics this connection receives.
    topics: BTreeSet<String>,
    /// Last inbound frame.
    last_activity: Instant,
    /// Outbound queue.
    sender: mpsc::Sender<RelayServerMessage>,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, RelayClient>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    clients: Clients,
    issuer: Option<Arc<SeatTokenIssuer>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a relay. Fails if tokens are required but no secret is set.
    pub fn new(config: RelayConfig) -> Result<Self, RelayServerError> {
        let issuer = if config.require_tokens {
            Some(Arc::new(SeatTokenIssuer::new(config.identity.clone())?))
        } else {
            None
        };
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            issuer,
            shutdown_tx,
        })
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), RelayServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayServerError> {
        info!("Relay listening on {}", listener.local_addr()?);

        let cleanup_clients = self.clients.clone();
        let cleanup_config = self.config.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_clients, cleanup_config).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Relay full, refusing {}", addr);
                                continue;
                            }

                            info!("Relay connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Serve one socket: frames are read here, written by a separate task.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let issuer = self.issuer.clone();
        let capacity = self.config.queue_capacity;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("Handshake with {} failed: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<RelayServerMessage>(capacity);

            clients.write().await.insert(addr, RelayClient {
                topics: BTreeSet::new(),
                last_activity: Instant::now(),
                sender: msg_tx.clone(),
            });

            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to encode relay frame: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let known = match clients.write().await.get_mut(&addr) {
                                    Some(client) => {
                                        client.last_activity = Instant::now();
                                        true
                                    }
                                    None => false,
                                };
                                if !known {
                                    debug!("Client {} expired", addr);
                                    break;
                                }
                                match RelayClientMessage::from_json(&text) {
                                    Ok(client_msg) => {
                                        Self::handle_client_message(addr, client_msg, &clients, issuer.as_deref(), &msg_tx).await;
                                    }
                                    Err(e) => {
                                        debug!("Unparseable frame from {}: {}", addr, e);
                                        let _ = msg_tx.send(RelayServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            "Invalid message format",
                                        )).await;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("{} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            clients.write().await.remove(&addr);
            drop(msg_tx);
            // let queued frames drain before the socket closes
            let _ = sender_task.await;
            info!("Relay connection {} closed", addr);
        });
    }

    /// Apply one client frame.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: RelayClientMessage,
        clients: &Clients,
        issuer: Option<&SeatTokenIssuer>,
        sender: &mpsc::Sender<RelayServerMessage>,
    ) {
        match msg {
            RelayClientMessage::Subscribe { topic, token } => {
                let Some(game_id) = topic_game_id(&topic) else {
                    let _ = sender.send(RelayServerMessage::subscribe_error(ErrorCode::InvalidTopic, &topic, format!("bad topic {topic}"))).await;
                    return;
                };
                if let Some(issuer) = issuer {
                    let checked = token
                        .as_deref()
                        .ok_or(IdentityError::MissingClaim("token".into()))
                        .and_then(|t| issuer.validate_for_game(t, game_id));
                    if let Err(e) = checked {
                        let code = if e == IdentityError::Expired { ErrorCode::TokenExpired } else { ErrorCode::Unauthorized };
                        warn!("Rejected subscribe from {} to {}: {}", addr, topic, e);
                        let _ = sender.send(RelayServerMessage::subscribe_error(code, &topic, e.to_string())).await;
                        return;
                    }
                }
                if let Some(client) = clients.write().await.get_mut(&addr) {
                    client.topics.insert(topic.clone());
                }
                debug!("{} subscribed to {}", addr, topic);
                let _ = sender.send(RelayServerMessage::Subscribed { topic }).await;
            }

            RelayClientMessage::Unsubscribe { topic } => {
                if let Some(client) = clients.write().await.get_mut(&addr) {
                    client.topics.remove(&topic);
                }
            }

            RelayClientMessage::Publish { topic, origin, event } => {
                let clients = clients.read().await;
                let subscribed = clients.get(&addr).is_some_and(|c| c.topics.contains(&topic));
                if !subscribed {
                    let _ = sender.send(RelayServerMessage::error(ErrorCode::NotSubscribed, format!("not subscribed to {topic}"))).await;
                    return;
                }

                let kind = event.kind();
                let frame = RelayServerMessage::Event { topic: topic.clone(), origin, event };
                let mut delivered = 0usize;
                for (peer, client) in clients.iter() {
                    if *peer == addr || !client.topics.contains(&topic) {
                        continue;
                    }
                    match client.sender.try_send(frame.clone()) {
                        Ok(()) => delivered += 1,
                        Err(_) => warn!("Dropping {} for slow client {}", kind.as_str(), peer),
                    }
                }
                debug!("{} from {} fanned out to {} peers", kind.as_str(), addr, delivered);
            }

            RelayClientMessage::Ping { timestamp } => {
                let _ = sender.send(RelayServerMessage::Pong {
                    timestamp,
                    server_time: Utc::now().timestamp_millis().max(0) as u64,
                }).await;
            }
        }
    }

    /// Drop idle connections periodically.
    async fn run_cleanup_loop(clients: Clients, config: RelayConfig) {
        let mut interval = interval(config.cleanup_interval);

        loop {
            interval.tick().await;

            let now = Instant::now();
            let mut clients = clients.write().await;
            let before = clients.len();
            // an expired connection is closed on its next frame
            clients.retain(|_, c| now.duration_since(c.last_activity) <= config.idle_timeout);
            let removed = before - clients.len();
            if removed > 0 {
                info!("Removed {} idle clients", removed);
            }
        }
    }

    /// Shutdown the relay.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connections.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Connections subscribed to a topic.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.clients.read().await.values().filter(|c| c.topics.contains(topic)).count()
    }
}
