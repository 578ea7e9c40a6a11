//! Lobby
//!
//! Creating a game and joining one by PIN. Joining is two writes (player row,
//! then status); if the second is lost the game stays `waiting` with two
//! players, which the sync engine heals on load.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::game::state::{normalize_player_name, Game, GameId, GameStatus, NameError, Player, PlayerNumber};
use crate::network::identity::{IdentityError, SeatIdentity, SeatTokenIssuer};
use crate::store::{GamePatch, GameStore, NewPlayer, StoreError};
use crate::PIN_LENGTH;

/// Lobby errors.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// Player name rejected.
    #[error(transparent)]
    Name(#[from] NameError),

    /// PIN is not four characters.
    #[error("PIN must be {PIN_LENGTH} characters")]
    InvalidPin,

    /// No waiting game has this PIN.
    #[error("no waiting game with PIN {pin}")]
    GameNotFound {
        /// PIN as entered
        pin: String,
    },

    /// Guest seat already taken.
    #[error("game {0} is full")]
    GameFull(GameId),

    /// Store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Token could not be issued.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// A seat handed out by create or join.
#[derive(Clone, Debug)]
pub struct SeatGrant {
    /// Seat identity
    pub seat: SeatIdentity,
    /// Game as last written by the lobby
    pub game: Game,
    /// The new player record
    pub player: Player,
    /// Signed seat token, when an issuer is configured
    pub token: Option<String>,
}

/// Create/join front door over a store.
#[derive(Clone)]
pub struct Lobby {
    store: Arc<dyn GameStore>,
    issuer: Option<Arc<SeatTokenIssuer>>,
}

impl Lobby {
    /// Lobby without seat tokens.
    pub fn new(store: Arc<dyn GameStore>) -> Self {
        Self { store, issuer: None }
    }

    /// Sign every granted seat.
    pub fn with_issuer(mut self, issuer: SeatTokenIssuer) -> Self {
        self.issuer = Some(Arc::new(issuer));
        self
    }

    /// Host a new game with a generated id.
    pub async fn create_game(&self, player_name: &str, show_opponent: bool) -> Result<SeatGrant, LobbyError> {
        self.create_game_with_id(GameId::generate(), player_name, show_opponent).await
    }

    /// Host a new game with a chosen id.
    #[instrument(skip(self), fields(game_id = %id))]
    pub async fn create_game_with_id(
        &self,
        id: GameId,
        player_name: &str,
        show_opponent: bool,
    ) -> Result<SeatGrant, LobbyError> {
        let player_name = normalize_player_name(player_name)?;
        let game = self.store.insert_game(Game::new(id, show_opponent)).await?;
        let player = self
            .store
            .insert_player(NewPlayer {
                game_id: game.id.clone(),
                player_number: PlayerNumber::One,
                player_name,
            })
            .await?;

        info!(pin = %game.pin(), "Game created");
        self.grant(game, player)
    }

    /// Take the guest seat of the waiting game with this PIN.
    ///
    /// When several waiting games share a PIN the newest one is joined.
    #[instrument(skip(self))]
    pub async fn join_game(&self, pin: &str, player_name: &str) -> Result<SeatGrant, LobbyError> {
        let player_name = normalize_player_name(player_name)?;
        let pin = pin.trim();
        if pin.chars().count() != PIN_LENGTH {
            return Err(LobbyError::InvalidPin);
        }

        let game = self
            .store
            .find_games_by_status(GameStatus::Waiting)
            .await?
            .into_iter()
            .filter(|g| g.id.matches_pin(pin))
            .max_by_key(|g| g.created_at)
            .ok_or_else(|| LobbyError::GameNotFound { pin: pin.to_uppercase() })?;

        let player = match self
            .store
            .insert_player(NewPlayer {
                game_id: game.id.clone(),
                player_number: PlayerNumber::Two,
                player_name,
            })
            .await
        {
            Ok(player) => player,
            Err(StoreError::Conflict(_)) => return Err(LobbyError::GameFull(game.id)),
            Err(e) => return Err(e.into()),
        };

        // the seat is taken either way; a lost status write is healed on load
        let game = match self.store.update_game(&game.id, GamePatch::status(GameStatus::Setup)).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(game_id = %game.id, "Status update after join failed: {}", e);
                game
            }
        };

        info!(game_id = %game.id, status = %game.status, "Joined game");
        self.grant(game, player)
    }

    fn grant(&self, game: Game, player: Player) -> Result<SeatGrant, LobbyError> {
        let seat = SeatIdentity::from_player(&player);
        let token = match &self.issuer {
            Some(issuer) => Some(issuer.issue(&seat)?),
            None => None,
        };
        Ok(SeatGrant { seat, game, player, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::identity::IdentityConfig;
    use crate::store::MemoryStore;

    fn lobby() -> (Arc<MemoryStore>, Lobby) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), Lobby::new(store))
    }

    #[tokio::test]
    async fn test_create_then_join_by_pin() {
        let (store, lobby) = lobby();
        let host = lobby.create_game_with_id(GameId::new("ABCD1234"), "Ann", true).await.unwrap();
        assert_eq!(host.seat.player_number, PlayerNumber::One);
        assert_eq!(host.game.status, GameStatus::Waiting);
        assert!(host.token.is_none());

        let guest = lobby.join_game("1234", " Bo ").await.unwrap();
        assert_eq!(guest.seat.player_number, PlayerNumber::Two);
        assert_eq!(guest.seat.player_name, "Bo");
        assert_eq!(guest.game.status, GameStatus::Setup);

        let players = store.list_players(&GameId::new("ABCD1234")).await.unwrap();
        assert_eq!(players.len(), 2);
    }

    #[tokio::test]
    async fn test_pin_is_case_insensitive() {
        let (_, lobby) = lobby();
        lobby.create_game_with_id(GameId::new("xyzwab9c"), "Ann", false).await.unwrap();
        let guest = lobby.join_game("AB9C", "Bo").await.unwrap();
        assert_eq!(guest.game.id, GameId::new("xyzwab9c"));
    }

    #[tokio::test]
    async fn test_unknown_pin_and_bad_input() {
        let (_, lobby) = lobby();
        assert!(matches!(lobby.join_game("9999", "Bo").await, Err(LobbyError::GameNotFound { .. })));
        assert!(matches!(lobby.join_game("99", "Bo").await, Err(LobbyError::InvalidPin)));
        assert!(matches!(lobby.create_game("   ", false).await, Err(LobbyError::Name(NameError::Empty))));
    }

    #[tokio::test]
    async fn test_started_game_cannot_be_joined() {
        let (_, lobby) = lobby();
        lobby.create_game_with_id(GameId::new("ABCD1234"), "Ann", false).await.unwrap();
        lobby.join_game("1234", "Bo").await.unwrap();
        // no longer waiting
        assert!(matches!(lobby.join_game("1234", "Cy").await, Err(LobbyError::GameNotFound { .. })));
    }

    #[tokio::test]
    async fn test_store_outage_is_reported() {
        let (store, lobby) = lobby();
        store.set_offline(true);
        assert!(matches!(lobby.create_game("Ann", false).await, Err(LobbyError::Store(StoreError::Unavailable(_)))));
    }

    #[tokio::test]
    async fn test_tokens_issued() {
        let (_, lobby) = lobby();
        let issuer = SeatTokenIssuer::new(IdentityConfig::with_secret("lobby-secret-0123456789abcdef")).unwrap();
        let lobby = lobby.with_issuer(issuer.clone());
        let host = lobby.create_game_with_id(GameId::new("ABCD1234"), "Ann", false).await.unwrap();
        let token = host.token.unwrap();
        assert_eq!(issuer.validate_for_game(&token, "ABCD1234").unwrap(), host.seat);
    }
}
