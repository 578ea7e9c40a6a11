//! Core primitives
//!
//! Deterministic randomness and session digests. Both are pure and shared by
//! every client so that replays and convergence checks line up.

pub mod rng;
pub mod digest;

pub use rng::DeterministicRng;
pub use digest::{SessionDigest, StateHasher};
