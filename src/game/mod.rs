//! Game Logic Module
//!
//! Records, rules and per-client state. Pure and synchronous: no I/O happens
//! below this module, so every client evaluates the same inputs the same way.
//!
//! ## Module Structure
//!
//! - `state`: Game, player and move records
//! - `board`: Line evaluation, setup drafts, random boards
//! - `session`: Per-client view and remote-event folds
//! - `turn`: Call and setup validation
//! - `events`: Broadcast event payloads

pub mod state;
pub mod board;
pub mod session;
pub mod turn;
pub mod events;

// Re-export key types
pub use state::{Game, GameId, GameStatus, Move, MoveId, Player, PlayerId, PlayerNumber};
pub use board::{evaluate, BoardDraft, BoardError, LineDescriptor, LineKind, LineReport};
pub use session::{FoldOutcome, SessionSnapshot, SessionState};
pub use turn::{CallOutcome, CallPlan, TurnError};
pub use events::{BroadcastEvent, EventKind};
