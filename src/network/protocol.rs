//! Relay Wire Protocol
//!
//! JSON text frames between a client and the broadcast relay. The relay only
//! routes `publish` frames to the other subscribers of a topic; it never looks
//! inside the event, persists it, or replays it.

use serde::{Serialize, Deserialize};

use crate::game::events::BroadcastEvent;
use crate::network::broadcast::ClientId;

// =============================================================================
// CLIENT -> RELAY
// =============================================================================

/// Messages sent from client to relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientMessage {
    /// Start receiving a topic.
    Subscribe {
        /// Topic name, `game:{id}`
        topic: String,
        /// Seat token, required when the relay checks identities
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Stop receiving a topic.
    Unsubscribe {
        /// Topic name
        topic: String,
    },

    /// Fan an event out to the other subscribers.
    Publish {
        /// Topic name
        topic: String,
        /// Sender, echoed to receivers for filtering
        origin: ClientId,
        /// The event
        event: BroadcastEvent,
    },

    /// Latency check.
    Ping {
        /// Client clock, millis
        timestamp: u64,
    },
}

// =============================================================================
// RELAY -> CLIENT
// =============================================================================

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerMessage {
    /// Subscription accepted.
    Subscribed {
        /// Topic name
        topic: String,
    },

    /// An event published by another connection.
    Event {
        /// Topic name
        topic: String,
        /// Publisher
        origin: ClientId,
        /// The event
        event: BroadcastEvent,
    },

    /// Reply to a ping.
    Pong {
        /// Echoed client clock
        timestamp: u64,
        /// Relay clock, millis
        server_time: u64,
    },

    /// Request rejected.
    Error(RelayError),
}

/// Error frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayError {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Topic of the rejected subscribe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed.
    InvalidMessage,
    /// Topic name is malformed.
    InvalidTopic,
    /// Seat token missing or rejected.
    Unauthorized,
    /// Seat token expired.
    TokenExpired,
    /// Publish to a topic this connection has not subscribed.
    NotSubscribed,
    /// Connection limit reached.
    ServerFull,
}

impl RelayClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl RelayServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Error frame helper.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        RelayServerMessage::Error(RelayError { code, message: message.into(), topic: None })
    }

    /// Error frame answering a subscribe to `topic`.
    pub fn subscribe_error(code: ErrorCode, topic: &str, message: impl Into<String>) -> Self {
        RelayServerMessage::Error(RelayError { code, message: message.into(), topic: Some(topic.to_string()) })
    }
}

/// Game id named by a session topic.
pub fn topic_game_id(topic: &str) -> Option<&str> {
    topic.strip_prefix("game:").filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Game, GameId};

    #[test]
    fn test_subscribe_wire_format() {
        let msg = RelayClientMessage::Subscribe { topic: "game:ABCD1234".into(), token: None };
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"subscribe","topic":"game:ABCD1234"}"#);
        assert_eq!(RelayClientMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn test_publish_carries_event() {
        let event = BroadcastEvent::GameUpdated { game: Game::new(GameId::new("ABCD1234"), false) };
        let msg = RelayClientMessage::Publish {
            topic: "game:ABCD1234".into(),
            origin: ClientId::generate(),
            event,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "publish");
        assert_eq!(value["event"]["type"], "game_updated");
    }

    #[test]
    fn test_error_frame() {
        let json = RelayServerMessage::error(ErrorCode::NotSubscribed, "subscribe first").to_json().unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("not_subscribed"));
        assert!(!json.contains("topic"));

        let json = RelayServerMessage::subscribe_error(ErrorCode::Unauthorized, "game:ABCD1234", "no seat")
            .to_json()
            .unwrap();
        match RelayServerMessage::from_json(&json).unwrap() {
            RelayServerMessage::Error(err) => assert_eq!(err.topic.as_deref(), Some("game:ABCD1234")),
            other => panic!("expected an error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_topic_game_id() {
        assert_eq!(topic_game_id("game:ABCD1234"), Some("ABCD1234"));
        assert_eq!(topic_game_id("game:"), None);
        assert_eq!(topic_game_id("lobby"), None);
    }
}
