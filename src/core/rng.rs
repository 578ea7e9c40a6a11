//! Seeded Randomness
//!
//! Boards dealt by the demo and the tests come from a seeded Xorshift128+
//! stream, so a seed reproduces a whole game.

/// Seeded Xorshift128+ generator.
///
/// # Example
///
/// ```
/// use bingo_duel::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(7);
/// let mut b = DeterministicRng::new(7);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeterministicRng {
    s0: u64,
    s1: u64,
}

impl DeterministicRng {
    /// Expand a 64-bit seed into generator state.
    pub fn new(seed: u64) -> Self {
        let mut expander = seed;
        let s0 = splitmix64(&mut expander);
        let s1 = splitmix64(&mut expander);
        if s0 | s1 == 0 {
            // the all-zero state is a fixed point
            return Self { s0: 1, s1: 1 };
        }
        Self { s0, s1 }
    }

    /// Seed from a fresh v4 UUID. Not reproducible.
    pub fn from_entropy() -> Self {
        let bits = uuid::Uuid::new_v4().as_u128();
        Self::new((bits >> 64) as u64 ^ bits as u64)
    }

    /// Next raw output.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let (x, mut y) = (self.s0, self.s1);
        let out = x.wrapping_add(y);
        y ^= x;
        self.s0 = x.rotate_left(24) ^ y ^ (y << 16);
        self.s1 = y.rotate_left(37);
        out
    }

    /// Uniform index in `0..bound`. Zero when `bound` is zero.
    #[inline]
    pub fn below(&mut self, bound: usize) -> usize {
        if bound == 0 {
            return 0;
        }
        // multiply-high keeps the bias below 2^-64 * bound
        ((self.next_u64() as u128 * bound as u128) >> 64) as usize
    }

    /// Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.below(i + 1);
            items.swap(i, j);
        }
    }

    /// A uniformly chosen element, `None` for an empty slice.
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        items.get(self.below(items.len()))
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = DeterministicRng::new(2024);
        let mut b = DeterministicRng::new(2024);
        assert!((0..500).all(|_| a.next_u64() == b.next_u64()));
        assert_ne!(DeterministicRng::new(1).next_u64(), DeterministicRng::new(2).next_u64());
    }

    #[test]
    fn test_below_stays_in_range() {
        let mut rng = DeterministicRng::new(5);
        assert!((0..1000).all(|_| rng.below(25) < 25));
        assert_eq!(rng.below(0), 0);
        assert_eq!(rng.below(1), 0);
    }

    #[test]
    fn test_shuffle_is_a_permutation() {
        let mut rng = DeterministicRng::new(1111);
        let mut numbers: Vec<u8> = (1..=25).collect();
        rng.shuffle(&mut numbers);
        assert_ne!(numbers, (1..=25).collect::<Vec<u8>>());
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=25).collect::<Vec<u8>>());
    }

    #[test]
    fn test_choose() {
        let mut rng = DeterministicRng::new(3);
        assert!(rng.choose::<u8>(&[]).is_none());
        assert_eq!(rng.choose(&[9u8]), Some(&9));
    }
}
