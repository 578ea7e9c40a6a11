//! # Bingo Duel
//!
//! Two-player networked bingo. Each player fills a private 5×5 board with
//! 1–25, then the players take turns calling numbers; five completed lines win.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        BINGO DUEL                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Xorshift128+ PRNG for random boards       │
//! │  └── digest.rs   - Session view digests                      │
//! │                                                              │
//! │  game/           - Rules and state (pure)                    │
//! │  ├── state.rs    - Game, player, move records                │
//! │  ├── board.rs    - Line evaluation and board setup           │
//! │  ├── session.rs  - Per-client view and event folds           │
//! │  ├── turn.rs     - Turn controller                           │
//! │  └── events.rs   - Broadcast events                          │
//! │                                                              │
//! │  store/          - Shared document store                     │
//! │  ├── mod.rs      - GameStore trait, patches                  │
//! │  └── memory.rs   - In-memory store with versions             │
//! │                                                              │
//! │  network/        - Broadcast transport and identity          │
//! │  ├── broadcast.rs- Broadcaster trait, in-process hub         │
//! │  ├── protocol.rs - Relay wire messages                       │
//! │  ├── relay.rs    - WebSocket relay server                    │
//! │  ├── ws_client.rs- WebSocket broadcaster                     │
//! │  └── identity.rs - Signed seat tokens                        │
//! │                                                              │
//! │  sync/           - Client synchronization                    │
//! │  ├── lobby.rs    - Create and join by PIN                    │
//! │  └── engine.rs   - Store + broadcast merge loop              │
//! │                                                              │
//! │  profile.rs      - Local profile file                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Model
//!
//! The store is the only durable authority. Every local action writes the
//! store first and then broadcasts the committed records. Broadcasts are
//! at-most-once and unordered, so each client folds them idempotently and
//! periodically re-reads the store:
//! - Records carry a version; older snapshots never overwrite newer ones
//! - Status only moves forward
//! - The turn is derived from the number of calls, not from a broadcast field
//!
//! Two clients that saw the same committed writes hold the same
//! [`SessionState::digest`](game::SessionState::digest).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod store;
pub mod network;
pub mod sync;
pub mod profile;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::state::{Game, GameId, GameStatus, Move, Player, PlayerId, PlayerNumber};
pub use game::board::{evaluate, LineReport};
pub use game::session::SessionState;
pub use store::{GameStore, MemoryStore};
pub use sync::{SyncEngine, SyncConfig, SyncError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cells per board side
pub const BOARD_SIDE: usize = 5;

/// Cells per board
pub const BOARD_CELLS: usize = BOARD_SIDE * BOARD_SIDE;

/// Highest number on a board (lowest is 1)
pub const MAX_NUMBER: u8 = 25;

/// Rows + columns + diagonals
pub const LINE_COUNT: usize = 12;

/// Completed lines needed to win
pub const WINNING_LINE_COUNT: usize = 5;

/// Characters of the game id used as join PIN
pub const PIN_LENGTH: usize = 4;

/// Longest accepted player name
pub const MAX_NAME_LENGTH: usize = 20;
