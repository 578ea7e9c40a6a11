//! Local Profile
//!
//! Per-device JSON file: the last player name, the chosen language, and the
//! seat this device holds in each game. The seat record is how a restarted
//! client finds its player again; it is matched by seat number and name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::game::state::{normalize_player_name, GameId, NameError, Player, PlayerId, PlayerNumber};
use crate::network::identity::SeatIdentity;

/// Default profile location.
pub const DEFAULT_PROFILE_PATH: &str = "bingo-profile.json";

/// Profile errors.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// File could not be read or written.
    #[error("profile I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not a valid profile.
    #[error("profile parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Player name rejected.
    #[error(transparent)]
    Name(#[from] NameError),
}

/// Seat remembered for one game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSeat {
    /// Seat number
    pub player_number: PlayerNumber,
    /// Name the seat was taken with
    pub player_name: String,
    /// Signed seat token, when the lobby issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl StoredSeat {
    /// Whether a player record is this seat.
    pub fn matches(&self, player: &Player) -> bool {
        player.player_number == self.player_number && player.player_name == self.player_name
    }

    /// Seat identity to reconnect with. The player id is left nil; connecting
    /// resolves it from the store by seat number and name.
    pub fn identity(&self, game_id: &GameId) -> SeatIdentity {
        SeatIdentity {
            game_id: game_id.clone(),
            player_id: PlayerId(Uuid::nil()),
            player_number: self.player_number,
            player_name: self.player_name.clone(),
        }
    }
}

/// Persistent per-device settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalProfile {
    /// Name used most recently
    #[serde(default)]
    pub last_player_name: Option<String>,
    /// Language code
    #[serde(default = "default_language")]
    pub language: String,
    /// Seats by game id
    #[serde(default)]
    pub seats: BTreeMap<GameId, StoredSeat>,
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for LocalProfile {
    fn default() -> Self {
        Self {
            last_player_name: None,
            language: default_language(),
            seats: BTreeMap::new(),
        }
    }
}

impl LocalProfile {
    /// Profile path from `BINGO_PROFILE_PATH`, or the default.
    pub fn path_from_env() -> PathBuf {
        std::env::var("BINGO_PROFILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROFILE_PATH))
    }

    /// Load a profile. A missing file yields the default profile.
    pub async fn load(path: &Path) -> Result<Self, ProfileError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No profile yet");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write the profile through a temporary file and rename.
    pub async fn save(&self, path: &Path) -> Result<(), ProfileError> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), seats = self.seats.len(), "Profile saved");
        Ok(())
    }

    /// Remember the last name used. Returns the normalized name.
    pub fn set_player_name(&mut self, name: &str) -> Result<String, ProfileError> {
        let name = normalize_player_name(name)?;
        self.last_player_name = Some(name.clone());
        Ok(name)
    }

    /// Remember the seat taken in a game.
    pub fn remember_seat(&mut self, seat: &SeatIdentity, token: Option<String>) {
        self.seats.insert(
            seat.game_id.clone(),
            StoredSeat {
                player_number: seat.player_number,
                player_name: seat.player_name.clone(),
                token,
            },
        );
        self.last_player_name = Some(seat.player_name.clone());
    }

    /// Seat held in a game.
    pub fn seat_for(&self, game_id: &GameId) -> Option<&StoredSeat> {
        self.seats.get(game_id)
    }

    /// Drop a game's seat.
    pub fn forget_seat(&mut self, game_id: &GameId) -> Option<StoredSeat> {
        self.seats.remove(game_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seat() -> SeatIdentity {
        SeatIdentity {
            game_id: GameId::new("ABCD1234"),
            player_id: PlayerId::generate(),
            player_number: PlayerNumber::Two,
            player_name: "Bo".into(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");

        let mut profile = LocalProfile::default();
        profile.language = "ko".into();
        profile.remember_seat(&seat(), Some("tok".into()));
        profile.save(&path).await.unwrap();

        let loaded = LocalProfile::load(&path).await.unwrap();
        assert_eq!(loaded, profile);
        let stored = loaded.seat_for(&GameId::new("ABCD1234")).unwrap();
        assert_eq!(stored.player_number, PlayerNumber::Two);
        assert_eq!(loaded.last_player_name.as_deref(), Some("Bo"));
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = LocalProfile::load(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(loaded, LocalProfile::default());
        assert_eq!(loaded.language, "en");
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(matches!(LocalProfile::load(&path).await, Err(ProfileError::Parse(_))));
    }

    #[test]
    fn test_set_player_name() {
        let mut profile = LocalProfile::default();
        assert_eq!(profile.set_player_name("  Ann ").unwrap(), "Ann");
        assert_eq!(profile.last_player_name.as_deref(), Some("Ann"));
        assert!(matches!(profile.set_player_name(" "), Err(ProfileError::Name(NameError::Empty))));
        assert_eq!(profile.last_player_name.as_deref(), Some("Ann"));
    }

    #[test]
    fn test_stored_seat_matches_number_and_name() {
        let mut profile = LocalProfile::default();
        profile.remember_seat(&seat(), None);
        let stored = profile.seat_for(&GameId::new("ABCD1234")).unwrap().clone();

        let mut player = Player::new(GameId::new("ABCD1234"), PlayerNumber::Two, "Bo");
        assert!(stored.matches(&player));
        player.player_number = PlayerNumber::One;
        assert!(!stored.matches(&player));

        let identity = stored.identity(&GameId::new("ABCD1234"));
        assert_eq!(identity.player_number, PlayerNumber::Two);
        assert!(identity.player_id.0.is_nil());
        assert!(profile.forget_seat(&GameId::new("ABCD1234")).is_some());
    }
}
