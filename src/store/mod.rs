//! Shared Document Store
//!
//! The one durable authority both clients write to. Three collections (games,
//! players, moves) with exact-id lookup, a status filter and ordered listings.
//!
//! Writes are field patches. Each write bumps the record version; a patch may
//! carry `expected_version` to turn the write into a compare-and-set.

pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::game::session::SessionSnapshot;
use crate::game::state::{Game, GameId, GameStatus, Move, Player, PlayerId, PlayerNumber};

pub use memory::MemoryStore;

/// Store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record with that key.
    #[error("{kind} not found: {key}")]
    NotFound {
        /// Collection name
        kind: &'static str,
        /// Looked-up key
        key: String,
    },

    /// Compare-and-set failed.
    #[error("version conflict on {kind} {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Collection name
        kind: &'static str,
        /// Record key
        key: String,
        /// Version the writer read
        expected: u64,
        /// Version in the store
        actual: u64,
    },

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Fields of a new player row. The store assigns id, timestamps and version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPlayer {
    /// Owning game
    pub game_id: GameId,
    /// Requested seat; must be free
    pub player_number: PlayerNumber,
    /// Display name
    pub player_name: String,
}

/// Fields of a new move row. The store assigns id, timestamp and sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMove {
    /// Owning game
    pub game_id: GameId,
    /// Number called; unique per game
    pub number_called: u8,
    /// Caller seat
    pub called_by_player: PlayerNumber,
}

/// Partial update of a game row. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GamePatch {
    /// New status
    pub status: Option<GameStatus>,
    /// New turn holder
    pub current_player: Option<PlayerNumber>,
    /// Winner to record
    pub winner: Option<PlayerNumber>,
    /// New setup flag
    pub setup_complete: Option<bool>,
    /// Write only if the row is still at this version
    pub expected_version: Option<u64>,
}

impl GamePatch {
    /// Patch setting the status.
    pub fn status(status: GameStatus) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Also set the turn holder.
    pub fn with_current_player(mut self, player: PlayerNumber) -> Self {
        self.current_player = Some(player);
        self
    }

    /// Also record a winner.
    pub fn with_winner(mut self, winner: PlayerNumber) -> Self {
        self.winner = Some(winner);
        self
    }

    /// Also set the setup flag.
    pub fn with_setup_complete(mut self, complete: bool) -> Self {
        self.setup_complete = Some(complete);
        self
    }

    /// Make the write conditional on the version read.
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Partial update of a player row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlayerPatch {
    /// New board layout
    pub board_numbers: Option<Vec<u8>>,
    /// New marked set
    pub marked_numbers: Option<BTreeSet<u8>>,
    /// New setup flag
    pub board_setup_complete: Option<bool>,
    /// Write only if the row is still at this version
    pub expected_version: Option<u64>,
}

impl PlayerPatch {
    /// Board submission: layout plus setup flag.
    pub fn board(board: Vec<u8>) -> Self {
        Self {
            board_numbers: Some(board),
            board_setup_complete: Some(true),
            ..Self::default()
        }
    }

    /// Marked set replacement.
    pub fn marks(marks: BTreeSet<u8>) -> Self {
        Self { marked_numbers: Some(marks), ..Self::default() }
    }
}

/// Shared store interface.
///
/// Implementations must be safe to share between tasks; every client holds
/// an `Arc<dyn GameStore>`.
#[async_trait]
pub trait GameStore: Send + Sync {
    /// Insert a game. Fails with `Conflict` if the id exists.
    async fn insert_game(&self, game: Game) -> Result<Game, StoreError>;

    /// Game by exact id.
    async fn get_game(&self, id: &GameId) -> Result<Game, StoreError>;

    /// Games with a given status, oldest first.
    async fn find_games_by_status(&self, status: GameStatus) -> Result<Vec<Game>, StoreError>;

    /// Apply a patch, returning the updated row.
    async fn update_game(&self, id: &GameId, patch: GamePatch) -> Result<Game, StoreError>;

    /// Insert a player. Fails with `Conflict` if the seat is taken.
    async fn insert_player(&self, player: NewPlayer) -> Result<Player, StoreError>;

    /// Players of a game ordered by player number.
    async fn list_players(&self, game_id: &GameId) -> Result<Vec<Player>, StoreError>;

    /// Apply a patch, returning the updated row.
    async fn update_player(&self, id: PlayerId, patch: PlayerPatch) -> Result<Player, StoreError>;

    /// Append a move. Fails with `Conflict` if the number was already called.
    async fn insert_move(&self, call: NewMove) -> Result<Move, StoreError>;

    /// Moves of a game ordered by creation.
    async fn list_moves(&self, game_id: &GameId) -> Result<Vec<Move>, StoreError>;

    /// Game, players and moves in one go.
    ///
    /// Three independent reads; the snapshot is not transactional.
    async fn load_session(&self, id: &GameId) -> Result<SessionSnapshot, StoreError> {
        let game = self.get_game(id).await?;
        let players = self.list_players(id).await?;
        let moves = self.list_moves(id).await?;
        Ok(SessionSnapshot { game, players, moves })
    }
}
