//! Game State Definitions
//!
//! The three shared record types (game, player, move) and their identifiers.
//! Sets use BTreeSet so iteration order, serialization and digests are stable
//! across both clients.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::{BOARD_CELLS, MAX_NAME_LENGTH, PIN_LENGTH};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Game identifier. Its trailing characters double as the join PIN.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

impl GameId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier (32 uppercase hex characters).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().to_uppercase())
    }

    /// Raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Human-shareable PIN: the last four characters, uppercased.
    pub fn pin(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let start = chars.len().saturating_sub(PIN_LENGTH);
        chars[start..].iter().collect::<String>().to_uppercase()
    }

    /// Case-insensitive PIN comparison.
    pub fn matches_pin(&self, pin: &str) -> bool {
        let pin = pin.trim();
        pin.chars().count() == PIN_LENGTH && self.pin().eq_ignore_ascii_case(pin)
    }

    /// Broadcast topic for this session.
    pub fn topic(&self) -> String {
        format!("game:{}", self.0)
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Player record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Move record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoveId(pub Uuid);

impl MoveId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

// =============================================================================
// PLAYER NUMBER
// =============================================================================

/// Seat of a player in the game. Serialized as the bare number 1 or 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PlayerNumber {
    /// The host, who created the game and calls first.
    One,
    /// The guest, who joined by PIN.
    Two,
}

impl PlayerNumber {
    /// Both seats in join order.
    pub const ALL: [PlayerNumber; 2] = [PlayerNumber::One, PlayerNumber::Two];

    /// The opposing seat.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            PlayerNumber::One => PlayerNumber::Two,
            PlayerNumber::Two => PlayerNumber::One,
        }
    }

    /// Numeric value (1 or 2).
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            PlayerNumber::One => 1,
            PlayerNumber::Two => 2,
        }
    }

    /// Seat from its numeric value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PlayerNumber::One),
            2 => Some(PlayerNumber::Two),
            _ => None,
        }
    }
}

impl TryFrom<u8> for PlayerNumber {
    type Error = InvalidPlayerNumber;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(InvalidPlayerNumber(value))
    }
}

impl From<PlayerNumber> for u8 {
    fn from(value: PlayerNumber) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for PlayerNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A player number outside {1, 2}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid player number {0}, expected 1 or 2")]
pub struct InvalidPlayerNumber(pub u8);

/// Rejected player name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Nothing left after trimming.
    #[error("player name is empty")]
    Empty,
    /// Longer than the limit.
    #[error("player name longer than {MAX_NAME_LENGTH} characters")]
    TooLong,
}

/// Trim a player name and check its length.
pub fn normalize_player_name(name: &str) -> Result<String, NameError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(NameError::TooLong);
    }
    Ok(name.to_string())
}

// =============================================================================
// GAME
// =============================================================================

/// Game lifecycle. Ordered: a status may only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Host created the game, guest not yet joined.
    Waiting,
    /// Both players present, filling boards.
    Setup,
    /// Numbers are being called.
    Playing,
    /// A winner was declared. Terminal.
    Finished,
}

impl GameStatus {
    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    #[inline]
    pub fn may_become(self, next: GameStatus) -> bool {
        next >= self
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Waiting => "waiting",
            GameStatus::Setup => "setup",
            GameStatus::Playing => "playing",
            GameStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shared game record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    /// Identifier (and PIN source)
    pub id: GameId,

    /// Lifecycle status
    pub status: GameStatus,

    /// Whose turn the last writer believed it was
    pub current_player: PlayerNumber,

    /// Set iff status is finished
    pub winner: Option<PlayerNumber>,

    /// Whether the opponent's board is visible to each player
    pub show_opponent: bool,

    /// Both boards submitted
    pub setup_complete: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl Game {
    /// A freshly created game waiting for its guest.
    pub fn new(id: GameId, show_opponent: bool) -> Self {
        Self {
            id,
            status: GameStatus::Waiting,
            current_player: PlayerNumber::One,
            winner: None,
            show_opponent,
            setup_complete: false,
            created_at: Utc::now(),
            version: 0,
        }
    }

    /// Join PIN.
    pub fn pin(&self) -> String {
        self.id.pin()
    }

    /// Terminal state reached.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status == GameStatus::Finished
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// One of the two seats in a game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Identifier
    pub id: PlayerId,

    /// Owning game
    pub game_id: GameId,

    /// Seat, assigned in join order
    pub player_number: PlayerNumber,

    /// Display name
    pub player_name: String,

    /// Row-major 5×5 layout; empty until setup is submitted
    pub board_numbers: Vec<u8>,

    /// Struck numbers
    pub marked_numbers: BTreeSet<u8>,

    /// Board submitted
    #[serde(default)]
    pub board_setup_complete: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl Player {
    /// A player with an empty board.
    pub fn new(game_id: GameId, player_number: PlayerNumber, player_name: impl Into<String>) -> Self {
        Self {
            id: PlayerId::generate(),
            game_id,
            player_number,
            player_name: player_name.into(),
            board_numbers: Vec::new(),
            marked_numbers: BTreeSet::new(),
            board_setup_complete: false,
            created_at: Utc::now(),
            version: 0,
        }
    }

    /// Whether `number` sits somewhere on this player's board.
    #[inline]
    pub fn has_number(&self, number: u8) -> bool {
        self.board_numbers.contains(&number)
    }

    /// Board holds a full layout.
    #[inline]
    pub fn has_full_board(&self) -> bool {
        self.board_numbers.len() == BOARD_CELLS
    }
}

// =============================================================================
// MOVE
// =============================================================================

/// A called number. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Identifier
    pub id: MoveId,

    /// Owning game
    pub game_id: GameId,

    /// Number called (1..=25)
    pub number_called: u8,

    /// Caller seat
    pub called_by_player: PlayerNumber,

    /// Creation time; primary order of the call history
    pub created_at: DateTime<Utc>,

    /// Store-assigned tie breaker for equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl Move {
    /// Total order of the call history.
    #[inline]
    pub fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }
}
