//! Broadcast Events
//!
//! The five event kinds exchanged on a session topic. Payloads carry full
//! records, never deltas, so a receiver can fold any of them without having
//! seen the ones before.
//!
//! Wire form: `{"type": "number_called", "payload": {"move": {..}, "updatedPlayers": [..]}}`.

use serde::{Serialize, Deserialize};

use crate::game::state::{Game, GameId, Move, Player, PlayerId, PlayerNumber};

/// Event kind, for logging and filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A second player took a seat
    PlayerJoined,
    /// A new game snapshot was written
    GameUpdated,
    /// A player submitted their board
    BoardSetupComplete,
    /// A number was called
    NumberCalled,
    /// The game ended with a winner
    GameFinished,
}

impl EventKind {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::PlayerJoined => "player_joined",
            EventKind::GameUpdated => "game_updated",
            EventKind::BoardSetupComplete => "board_setup_complete",
            EventKind::NumberCalled => "number_called",
            EventKind::GameFinished => "game_finished",
        }
    }
}

/// A session broadcast event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// Guest joined.
    PlayerJoined {
        /// The new player record
        player: Player,
    },

    /// Authoritative game snapshot.
    GameUpdated {
        /// Game record after the write
        game: Game,
    },

    /// A board was submitted.
    BoardSetupComplete {
        /// Submitting player
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        /// Submitting seat
        #[serde(rename = "playerNumber")]
        player_number: PlayerNumber,
    },

    /// A number was called.
    NumberCalled {
        /// The persisted move
        #[serde(rename = "move")]
        call: Move,
        /// Every player record after marking
        #[serde(rename = "updatedPlayers")]
        updated_players: Vec<Player>,
    },

    /// The game was won.
    GameFinished {
        /// Full record of the winning player
        winner: Player,
        /// Finished game snapshot
        game: Game,
    },
}

impl BroadcastEvent {
    /// Event kind.
    pub fn kind(&self) -> EventKind {
        match self {
            BroadcastEvent::PlayerJoined { .. } => EventKind::PlayerJoined,
            BroadcastEvent::GameUpdated { .. } => EventKind::GameUpdated,
            BroadcastEvent::BoardSetupComplete { .. } => EventKind::BoardSetupComplete,
            BroadcastEvent::NumberCalled { .. } => EventKind::NumberCalled,
            BroadcastEvent::GameFinished { .. } => EventKind::GameFinished,
        }
    }

    /// Game the event belongs to, when the payload names it.
    pub fn game_id(&self) -> Option<&GameId> {
        match self {
            BroadcastEvent::PlayerJoined { player } => Some(&player.game_id),
            BroadcastEvent::GameUpdated { game } => Some(&game.id),
            BroadcastEvent::BoardSetupComplete { .. } => None,
            BroadcastEvent::NumberCalled { call, .. } => Some(&call.game_id),
            BroadcastEvent::GameFinished { game, .. } => Some(&game.id),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
