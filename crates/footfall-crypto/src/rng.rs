//! xoshiro256+, the per-invocation tie-break generator.
//!
//! Algorithm by David Blackman and Sebastiano Vigna
//! (<https://prng.di.unimi.it/xoshiro256plus.c>, public domain). A weak,
//! fast generator is all the ranking tie-break needs; it is seeded from
//! the OS CSPRNG so ties do not resolve the same way across invocations,
//! and from a fixed seed in tests to make the pipeline deterministic.

use rand::rngs::OsRng;
use rand::RngCore;

pub struct Xoshiro256Plus {
    state: [u64; 4],
}

impl Xoshiro256Plus {
    /// Seed from the OS CSPRNG.
    pub fn from_entropy() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic construction. The state must not be all zero.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut state = [0u64; 4];
        for (word, chunk) in state.iter_mut().zip(seed.chunks_exact(8)) {
            *word = u64::from_le_bytes(chunk.try_into().expect("8-byte chunk"));
        }
        if state == [0u64; 4] {
            // All-zero is the one forbidden state.
            state[0] = 1;
        }
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let result = self.state[0].wrapping_add(self.state[3]);

        let t = self.state[1] << 17;

        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];

        self.state[2] ^= t;

        self.state[3] = self.state[3].rotate_left(45);

        result
    }

    /// 16 random bytes, the side sort key used for ranking tie-breaks.
    pub fn next_tie_break(&mut self) -> u128 {
        (u128::from(self.next_u64()) << 64) | u128::from(self.next_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_with_words(words: [u64; 4]) -> [u8; 32] {
        let mut seed = [0u8; 32];
        for (chunk, word) in seed.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        seed
    }

    #[test]
    fn matches_reference_sequence() {
        // First two outputs for state [1, 2, 3, 4], stepped by hand from
        // the reference implementation.
        let mut rng = Xoshiro256Plus::from_seed(seed_with_words([1, 2, 3, 4]));
        assert_eq!(rng.next_u64(), 5);
        assert_eq!(rng.next_u64(), 211_106_232_532_999);
    }

    #[test]
    fn fixed_seed_is_deterministic() {
        let seed = seed_with_words([9, 8, 7, 6]);
        let mut a = Xoshiro256Plus::from_seed(seed);
        let mut b = Xoshiro256Plus::from_seed(seed);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn zero_seed_is_rescued() {
        let mut rng = Xoshiro256Plus::from_seed([0u8; 32]);
        // Would be stuck at 0 forever if the all-zero state were allowed.
        let outputs: Vec<u64> = (0..4).map(|_| rng.next_u64()).collect();
        assert!(outputs.iter().any(|&v| v != 0));
    }
}
