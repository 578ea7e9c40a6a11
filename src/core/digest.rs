//! Session Digests
//!
//! Deterministic SHA-256 over the parts of a session view that both clients
//! must agree on. Two clients that converged produce the same digest;
//! versions and timestamps are left out since they are store bookkeeping.

use sha2::{Sha256, Digest};

/// Digest output (32 bytes).
pub type SessionDigest = [u8; 32];

/// Domain separator for session view digests.
pub const SESSION_DOMAIN: &[u8] = b"BINGO_DUEL_SESSION_V1";

/// Incremental hasher with fixed-width, little-endian encodings.
///
/// Order of updates is part of the digest.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with a domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Hasher for session views.
    pub fn for_session() -> Self {
        Self::new(SESSION_DOMAIN)
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a length-prefixed string.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Update with a u8 value.
    #[inline]
    pub fn update_u8(&mut self, value: u8) {
        self.hasher.update([value]);
    }

    /// Update with a u32 value.
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a u64 value.
    #[inline]
    pub fn update_u64(&mut self, value: u64) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.update_u8(value as u8);
    }

    /// Update with a UUID (16 bytes).
    #[inline]
    pub fn update_uuid(&mut self, uuid: &uuid::Uuid) {
        self.hasher.update(uuid.as_bytes());
    }

    /// Update with a length-prefixed byte sequence.
    pub fn update_u8_seq<'a>(&mut self, values: impl ExactSizeIterator<Item = &'a u8>) {
        self.update_u32(values.len() as u32);
        for v in values {
            self.update_u8(*v);
        }
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> SessionDigest {
        self.hasher.finalize().into()
    }
}

/// Short hex prefix for log lines.
pub fn short_hex(digest: &SessionDigest) -> String {
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_determinism() {
        let build = || {
            let mut h = StateHasher::for_session();
            h.update_str("ABCD1234");
            h.update_u8(2);
            h.update_bool(true);
            h.update_u8_seq([1u8, 2, 3].iter());
            h.finalize()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_order_matters() {
        let mut a = StateHasher::for_session();
        a.update_u8(1);
        a.update_u8(2);
        let mut b = StateHasher::for_session();
        b.update_u8(2);
        b.update_u8(1);
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_length_prefix_separates_strings() {
        let mut a = StateHasher::for_session();
        a.update_str("ab");
        a.update_str("c");
        let mut b = StateHasher::for_session();
        b.update_str("a");
        b.update_str("bc");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn test_domain_separation() {
        let a = StateHasher::new(b"A").finalize();
        let b = StateHasher::new(b"B").finalize();
        assert_ne!(a, b);
        assert_eq!(short_hex(&a).len(), 16);
    }
}
