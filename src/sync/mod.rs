//! Client Synchronization
//!
//! - `lobby`: Create a game, join one by PIN
//! - `engine`: Keep a client's view in step with the store and the broadcast

pub mod engine;
pub mod lobby;

pub use engine::{ClientCommand, SessionHandle, SyncConfig, SyncEngine, SyncError};
pub use lobby::{Lobby, LobbyError, SeatGrant};
