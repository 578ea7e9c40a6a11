//! In-memory store.
//!
//! Reference `GameStore` used by the demo and the tests. Collections live in
//! `BTreeMap`s behind one `RwLock`, so each call is atomic and listings are
//! deterministic. An offline switch makes every call fail with
//! `StoreError::Unavailable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{GamePatch, GameStore, NewMove, NewPlayer, PlayerPatch, StoreError};
use crate::game::state::{Game, GameId, GameStatus, Move, MoveId, Player, PlayerId};

#[derive(Default)]
struct Tables {
    games: BTreeMap<GameId, Game>,
    players: BTreeMap<PlayerId, Player>,
    moves: BTreeMap<MoveId, Move>,
    next_sequence: u64,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }
}

fn check_version(kind: &'static str, key: String, expected: Option<u64>, actual: u64) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != actual => Err(StoreError::VersionConflict { kind, key, expected, actual }),
        _ => Ok(()),
    }
}

#[async_trait]
impl GameStore for MemoryStore {
    #[instrument(skip(self, game), fields(game_id = %game.id))]
    async fn insert_game(&self, mut game: Game) -> Result<Game, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        if tables.games.contains_key(&game.id) {
            return Err(StoreError::Conflict(format!("game {} exists", game.id)));
        }
        game.version = 1;
        tables.games.insert(game.id.clone(), game.clone());
        debug!("game inserted");
        Ok(game)
    }

    async fn get_game(&self, id: &GameId) -> Result<Game, StoreError> {
        self.check_online()?;
        let tables = self.tables.read().await;
        tables.games.get(id).cloned().ok_or_else(|| StoreError::NotFound {
            kind: "game",
            key: id.to_string(),
        })
    }

    async fn find_games_by_status(&self, status: GameStatus) -> Result<Vec<Game>, StoreError> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let mut games: Vec<Game> = tables.games.values().filter(|g| g.status == status).cloned().collect();
        games.sort_by_key(|g| g.created_at);
        Ok(games)
    }

    #[instrument(skip(self, patch), fields(game_id = %id))]
    async fn update_game(&self, id: &GameId, patch: GamePatch) -> Result<Game, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let game = tables.games.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "game",
            key: id.to_string(),
        })?;
        check_version("game", id.to_string(), patch.expected_version, game.version)?;

        if let Some(status) = patch.status {
            game.status = status;
        }
        if let Some(player) = patch.current_player {
            game.current_player = player;
        }
        if let Some(winner) = patch.winner {
            game.winner = Some(winner);
        }
        if let Some(complete) = patch.setup_complete {
            game.setup_complete = complete;
        }
        game.version += 1;
        debug!(status = %game.status, version = game.version, "game updated");
        Ok(game.clone())
    }

    #[instrument(skip(self, player), fields(game_id = %player.game_id, seat = %player.player_number))]
    async fn insert_player(&self, player: NewPlayer) -> Result<Player, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        if !tables.games.contains_key(&player.game_id) {
            return Err(StoreError::NotFound { kind: "game", key: player.game_id.to_string() });
        }
        let seat_taken = tables
            .players
            .values()
            .any(|p| p.game_id == player.game_id && p.player_number == player.player_number);
        if seat_taken {
            return Err(StoreError::Conflict(format!(
                "seat {} of game {} is taken",
                player.player_number, player.game_id
            )));
        }

        let mut record = Player::new(player.game_id, player.player_number, player.player_name);
        record.version = 1;
        tables.players.insert(record.id, record.clone());
        debug!(player_id = %record.id, "player inserted");
        Ok(record)
    }

    async fn list_players(&self, game_id: &GameId) -> Result<Vec<Player>, StoreError> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let mut players: Vec<Player> = tables.players.values().filter(|p| &p.game_id == game_id).cloned().collect();
        players.sort_by_key(|p| p.player_number);
        Ok(players)
    }

    #[instrument(skip(self, patch), fields(player_id = %id))]
    async fn update_player(&self, id: PlayerId, patch: PlayerPatch) -> Result<Player, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        let player = tables.players.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            kind: "player",
            key: id.to_string(),
        })?;
        check_version("player", id.to_string(), patch.expected_version, player.version)?;

        if let Some(board) = patch.board_numbers {
            player.board_numbers = board;
        }
        if let Some(marks) = patch.marked_numbers {
            player.marked_numbers = marks;
        }
        if let Some(complete) = patch.board_setup_complete {
            player.board_setup_complete = complete;
        }
        player.version += 1;
        debug!(version = player.version, marks = player.marked_numbers.len(), "player updated");
        Ok(player.clone())
    }

    #[instrument(skip(self, call), fields(game_id = %call.game_id, number = call.number_called))]
    async fn insert_move(&self, call: NewMove) -> Result<Move, StoreError> {
        self.check_online()?;
        let mut tables = self.tables.write().await;
        if !tables.games.contains_key(&call.game_id) {
            return Err(StoreError::NotFound { kind: "game", key: call.game_id.to_string() });
        }
        let duplicate = tables
            .moves
            .values()
            .any(|m| m.game_id == call.game_id && m.number_called == call.number_called);
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "number {} already called in game {}",
                call.number_called, call.game_id
            )));
        }

        tables.next_sequence += 1;
        let record = Move {
            id: MoveId::generate(),
            game_id: call.game_id,
            number_called: call.number_called,
            called_by_player: call.called_by_player,
            created_at: Utc::now(),
            sequence: tables.next_sequence,
        };
        tables.moves.insert(record.id, record.clone());
        debug!(sequence = record.sequence, "move inserted");
        Ok(record)
    }

    async fn list_moves(&self, game_id: &GameId) -> Result<Vec<Move>, StoreError> {
        self.check_online()?;
        let tables = self.tables.read().await;
        let mut moves: Vec<Move> = tables.moves.values().filter(|m| &m.game_id == game_id).cloned().collect();
        moves.sort_by_key(Move::order_key);
        Ok(moves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::PlayerNumber;

    async fn seeded() -> (MemoryStore, Game) {
        let store = MemoryStore::new();
        let game = store.insert_game(Game::new(GameId::new("ABCD1234"), false)).await.unwrap();
        (store, game)
    }

    fn seat(game: &Game, number: PlayerNumber, name: &str) -> NewPlayer {
        NewPlayer { game_id: game.id.clone(), player_number: number, player_name: name.into() }
    }

    #[tokio::test]
    async fn test_insert_and_get_game() {
        let (store, game) = seeded().await;
        assert_eq!(game.version, 1);
        assert_eq!(store.get_game(&game.id).await.unwrap(), game);
        assert!(matches!(
            store.insert_game(Game::new(game.id.clone(), true)).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.get_game(&GameId::new("nope")).await,
            Err(StoreError::NotFound { kind: "game", .. })
        ));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_checks_expected() {
        let (store, game) = seeded().await;
        let updated = store
            .update_game(&game.id, GamePatch::status(GameStatus::Setup).expect_version(1))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status, GameStatus::Setup);

        let err = store
            .update_game(&game.id, GamePatch::status(GameStatus::Playing).expect_version(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, actual: 2, .. }));
        assert_eq!(store.get_game(&game.id).await.unwrap().status, GameStatus::Setup);
    }

    #[tokio::test]
    async fn test_seat_uniqueness_and_order() {
        let (store, game) = seeded().await;
        store.insert_player(seat(&game, PlayerNumber::Two, "Bo")).await.unwrap();
        store.insert_player(seat(&game, PlayerNumber::One, "Ann")).await.unwrap();
        assert!(matches!(
            store.insert_player(seat(&game, PlayerNumber::One, "Cy")).await,
            Err(StoreError::Conflict(_))
        ));
        let players = store.list_players(&game.id).await.unwrap();
        let names: Vec<_> = players.iter().map(|p| p.player_name.as_str()).collect();
        assert_eq!(names, vec!["Ann", "Bo"]);
    }

    #[tokio::test]
    async fn test_moves_unique_and_ordered() {
        let (store, game) = seeded().await;
        for (n, by) in [(7, PlayerNumber::One), (3, PlayerNumber::Two)] {
            store
                .insert_move(NewMove { game_id: game.id.clone(), number_called: n, called_by_player: by })
                .await
                .unwrap();
        }
        let dup = NewMove { game_id: game.id.clone(), number_called: 7, called_by_player: PlayerNumber::One };
        assert!(matches!(store.insert_move(dup).await, Err(StoreError::Conflict(_))));

        let moves = store.list_moves(&game.id).await.unwrap();
        let numbers: Vec<u8> = moves.iter().map(|m| m.number_called).collect();
        assert_eq!(numbers, vec![7, 3]);
        assert!(moves[0].sequence < moves[1].sequence);
    }

    #[tokio::test]
    async fn test_find_by_status_and_load_session() {
        let (store, game) = seeded().await;
        store.insert_game(Game::new(GameId::new("OTHER999"), false)).await.unwrap();
        store.update_game(&GameId::new("OTHER999"), GamePatch::status(GameStatus::Setup)).await.unwrap();

        let waiting = store.find_games_by_status(GameStatus::Waiting).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, game.id);

        store.insert_player(seat(&game, PlayerNumber::One, "Ann")).await.unwrap();
        let snapshot = store.load_session(&game.id).await.unwrap();
        assert_eq!(snapshot.players.len(), 1);
        assert!(snapshot.moves.is_empty());
    }

    #[tokio::test]
    async fn test_offline() {
        let (store, game) = seeded().await;
        store.set_offline(true);
        assert!(matches!(store.get_game(&game.id).await, Err(StoreError::Unavailable(_))));
        store.set_offline(false);
        assert!(store.get_game(&game.id).await.is_ok());
    }
}
