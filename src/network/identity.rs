//! Seat Identity
//!
//! Who sits where in a game. Create and join hand out a `SeatIdentity`; the
//! issuer signs it as an HS256 JWT so a client can present its seat to the
//! relay or reclaim it after a restart.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::game::state::{GameId, Player, PlayerId, PlayerNumber};

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Issuer claim written into every seat token.
pub const TOKEN_ISSUER: &str = "bingo-duel";

/// A player's seat in a game.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatIdentity {
    /// Game
    pub game_id: GameId,
    /// Player record
    pub player_id: PlayerId,
    /// Seat
    pub player_number: PlayerNumber,
    /// Display name at join time
    pub player_name: String,
}

impl SeatIdentity {
    /// Identity of an existing player record.
    pub fn from_player(player: &Player) -> Self {
        Self {
            game_id: player.game_id.clone(),
            player_id: player.id,
            player_number: player.player_number,
            player_name: player.player_name.clone(),
        }
    }

    /// Whether a player record is this seat: same number and same name.
    pub fn matches(&self, player: &Player) -> bool {
        player.game_id == self.game_id
            && player.player_number == self.player_number
            && player.player_name == self.player_name
    }
}

/// Token configuration.
#[derive(Clone, Debug)]
pub struct IdentityConfig {
    /// HS256 secret. Tokens are disabled without one.
    pub secret: Option<String>,
    /// Lifetime of issued tokens.
    pub token_ttl: Duration,
    /// Whether to skip expiry validation (for testing only).
    pub skip_expiry: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            secret: None,
            token_ttl: DEFAULT_TOKEN_TTL,
            skip_expiry: false,
        }
    }
}

impl IdentityConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            secret: std::env::var("BINGO_SEAT_SECRET").ok().filter(|s| !s.is_empty()),
            token_ttl: std::env::var("BINGO_TOKEN_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.token_ttl),
            skip_expiry: std::env::var("BINGO_TOKEN_SKIP_EXPIRY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Config with a secret and default lifetime.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self { secret: Some(secret.into()), ..Self::default() }
    }

    /// Check if tokens are enabled.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

/// Claims of a seat token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatClaims {
    /// Player id
    pub sub: String,
    /// Game id
    pub game: String,
    /// Seat, 1 or 2
    pub seat: u8,
    /// Display name
    pub name: String,
    /// Issued at (Unix seconds)
    #[serde(default)]
    pub iat: u64,
    /// Expiry (Unix seconds)
    pub exp: u64,
    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,
}

impl SeatClaims {
    /// Seat identity carried by the claims.
    pub fn identity(&self) -> Result<SeatIdentity, IdentityError> {
        let player_id = PlayerId::from_uuid_str(&self.sub).ok_or_else(|| IdentityError::MissingClaim("sub".into()))?;
        let player_number = PlayerNumber::from_u8(self.seat).ok_or_else(|| IdentityError::MissingClaim("seat".into()))?;
        if self.game.is_empty() {
            return Err(IdentityError::MissingClaim("game".into()));
        }
        Ok(SeatIdentity {
            game_id: GameId::new(self.game.clone()),
            player_id,
            player_number,
            player_name: self.name.clone(),
        })
    }
}

/// Identity errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// No secret configured.
    #[error("seat tokens not configured")]
    NotConfigured,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim is not ours.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Required claim missing or malformed.
    #[error("missing required claim: {0}")]
    MissingClaim(String),
    /// Token is for another game.
    #[error("token is for game {token_game}, not {expected}")]
    WrongGame {
        /// Game named by the token
        token_game: String,
        /// Game the token was presented for
        expected: String,
    },
    /// Encoding or decoding failure.
    #[error("token error: {0}")]
    Token(String),
}

/// Issues and validates seat tokens.
#[derive(Clone)]
pub struct SeatTokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    config: IdentityConfig,
}

impl SeatTokenIssuer {
    /// Build from config. Fails when no secret is set.
    pub fn new(config: IdentityConfig) -> Result<Self, IdentityError> {
        let secret = config.secret.as_deref().ok_or(IdentityError::NotConfigured)?;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            config,
        })
    }

    /// Sign a seat.
    pub fn issue(&self, seat: &SeatIdentity) -> Result<String, IdentityError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let claims = SeatClaims {
            sub: seat.player_id.to_string(),
            game: seat.game_id.to_string(),
            seat: seat.player_number.as_u8(),
            name: seat.player_name.clone(),
            iat: now,
            exp: now + self.config.token_ttl.as_secs(),
            iss: Some(TOKEN_ISSUER.to_string()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| IdentityError::Token(e.to_string()))
    }

    /// Validate a token and return its claims.
    pub fn validate(&self, token: &str) -> Result<SeatClaims, IdentityError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.validate_aud = false;
        if self.config.skip_expiry {
            validation.validate_exp = false;
        }

        let claims = decode::<SeatClaims>(token, &self.decoding, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if claims.sub.is_empty() {
            return Err(IdentityError::MissingClaim("sub".into()));
        }
        // jsonwebtoken allows some leeway; be strict about the deadline
        let now = Utc::now().timestamp().max(0) as u64;
        if !self.config.skip_expiry && now > claims.exp {
            return Err(IdentityError::Expired);
        }
        Ok(claims)
    }

    /// Validate a token presented for a specific game.
    pub fn validate_for_game(&self, token: &str, game_id: &str) -> Result<SeatIdentity, IdentityError> {
        let claims = self.validate(token)?;
        if claims.game != game_id {
            return Err(IdentityError::WrongGame {
                token_game: claims.game,
                expected: game_id.to_string(),
            });
        }
        claims.identity()
    }
}

/// Map JWT library errors to our error type.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> IdentityError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => IdentityError::Expired,
        ErrorKind::InvalidSignature => IdentityError::InvalidSignature,
        ErrorKind::InvalidIssuer => IdentityError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => IdentityError::InvalidFormat,
        _ => IdentityError::Token(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-key-256-bits-long!!";

    fn seat() -> SeatIdentity {
        SeatIdentity {
            game_id: GameId::new("ABCD1234"),
            player_id: PlayerId::generate(),
            player_number: PlayerNumber::Two,
            player_name: "Bo".into(),
        }
    }

    fn issuer() -> SeatTokenIssuer {
        SeatTokenIssuer::new(IdentityConfig::with_secret(SECRET)).unwrap()
    }

    #[test]
    fn test_issue_and_validate() {
        let seat = seat();
        let token = issuer().issue(&seat).unwrap();
        let claims = issuer().validate(&token).unwrap();
        assert_eq!(claims.seat, 2);
        assert_eq!(claims.iss.as_deref(), Some(TOKEN_ISSUER));
        assert_eq!(issuer().validate_for_game(&token, "ABCD1234").unwrap(), seat);
    }

    #[test]
    fn test_wrong_game_rejected() {
        let token = issuer().issue(&seat()).unwrap();
        assert!(matches!(
            issuer().validate_for_game(&token, "ZZZZ0000"),
            Err(IdentityError::WrongGame { .. })
        ));
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let token = issuer().issue(&seat()).unwrap();
        let other = SeatTokenIssuer::new(IdentityConfig::with_secret("another-secret-entirely!!")).unwrap();
        assert_eq!(other.validate(&token), Err(IdentityError::InvalidSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = IdentityConfig { token_ttl: Duration::ZERO, ..IdentityConfig::with_secret(SECRET) };
        let issuer = SeatTokenIssuer::new(config).unwrap();
        let mut claims = issuer.validate(&issuer.issue(&seat()).unwrap()).unwrap();
        claims.exp = 1;
        let token = encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
        assert_eq!(issuer.validate(&token), Err(IdentityError::Expired));

        let lenient = SeatTokenIssuer::new(IdentityConfig { skip_expiry: true, ..IdentityConfig::with_secret(SECRET) }).unwrap();
        assert!(lenient.validate(&token).is_ok());
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(issuer().validate("not-a-token"), Err(IdentityError::InvalidFormat));
    }

    #[test]
    fn test_not_configured() {
        assert!(matches!(SeatTokenIssuer::new(IdentityConfig::default()), Err(IdentityError::NotConfigured)));
    }

    #[test]
    fn test_seat_matches_number_and_name() {
        let mut player = Player::new(GameId::new("ABCD1234"), PlayerNumber::Two, "Bo");
        let seat = SeatIdentity { player_id: player.id, ..seat() };
        assert!(seat.matches(&player));
        player.player_name = "Bob".into();
        assert!(!seat.matches(&player));
        assert_eq!(SeatIdentity::from_player(&player).player_name, "Bob");
    }
}
