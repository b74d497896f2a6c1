//! Cryptographic building blocks of the analytics core: pseudonym
//! resolution, symmetric key material, and the tie-break RNG.

pub mod pseudonym;
pub mod rng;

use footfall_types::params::KEY_LEN;
use rand::rngs::OsRng;
use rand::RngCore;

pub use pseudonym::{decrypt_pseudonym, encrypt_pseudonym};
pub use rng::Xoshiro256Plus;

/// 16 bytes of symmetric key material: a periodic pseudonymisation key or
/// a per-generation footprint file key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymmetricKey(pub [u8; KEY_LEN]);

impl SymmetricKey {
    /// Draw a fresh key from the OS CSPRNG.
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub const fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}
