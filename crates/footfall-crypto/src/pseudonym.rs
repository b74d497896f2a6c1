//! Reversal of the per-period user-identifier pseudonymisation.
//!
//! A pseudonym is one AES block: the 12-byte stable user id concatenated
//! with the first 4 bytes of `HMAC-SHA256(key, user id)`, encrypted with
//! AES-128-CTR under the periodic key and an all-zero initial counter
//! block. Decryption therefore both recovers the stable id and
//! authenticates it; a failed tag comparison means the pseudonym was not
//! produced under this period's key.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes128;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use footfall_error::{FootfallError, Result};
use footfall_types::params::{HMAC_TAG_LEN, USER_ID_LEN};
use footfall_types::{PseudonymisedUserId, UserId};

use crate::SymmetricKey;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

fn apply_keystream(key: &SymmetricKey, block: &mut [u8; 16]) {
    // CTR mode is its own inverse; the counter starts at the zero block.
    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), &[0u8; 16].into());
    cipher.apply_keystream(block);
}

fn user_id_tag(key: &SymmetricKey, user: &UserId) -> [u8; HMAC_TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(user);
    let digest = mac.finalize().into_bytes();
    digest[..HMAC_TAG_LEN].try_into().expect("tag prefix")
}

/// Decrypt a pseudonymised user identifier and verify its embedded tag.
pub fn decrypt_pseudonym(
    key: &SymmetricKey,
    pseudonym: &PseudonymisedUserId,
) -> Result<UserId> {
    let mut block = *pseudonym;
    apply_keystream(key, &mut block);

    let user: UserId = block[..USER_ID_LEN].try_into().expect("user id part");
    let tag: [u8; HMAC_TAG_LEN] = block[USER_ID_LEN..].try_into().expect("tag part");

    if tag != user_id_tag(key, &user) {
        return Err(FootfallError::PseudonymCheckFailed);
    }
    Ok(user)
}

/// Produce the pseudonym of a stable user id under a periodic key. The
/// inverse of [`decrypt_pseudonym`]; used by data generators and tests.
pub fn encrypt_pseudonym(key: &SymmetricKey, user: &UserId) -> PseudonymisedUserId {
    let mut block = [0u8; 16];
    block[..USER_ID_LEN].copy_from_slice(user);
    block[USER_ID_LEN..].copy_from_slice(&user_id_tag(key, user));
    apply_keystream(key, &mut block);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // Known-answer vectors produced by the pseudonymisation component.

    #[test]
    fn decrypt_known_pseudonym_1() {
        let key = SymmetricKey([
            0x60, 0x8b, 0x23, 0xb7, 0x23, 0x63, 0x0c, 0x30, 0x43, 0x85, 0xb4, 0xeb, 0xd0, 0x05,
            0x37, 0x01,
        ]);
        let pseudonym: PseudonymisedUserId = [
            0x13, 0xbf, 0xfe, 0x75, 0x26, 0x1b, 0x0f, 0xa7, 0x84, 0x42, 0x30, 0x94, 0x93, 0x6b,
            0xa6, 0xd7,
        ];
        let expected: UserId = [
            0x95, 0xe5, 0x12, 0x4f, 0xa2, 0x53, 0x0b, 0x6b, 0xec, 0x01, 0xff, 0x60,
        ];
        assert_eq!(decrypt_pseudonym(&key, &pseudonym).unwrap(), expected);
    }

    #[test]
    fn decrypt_known_pseudonym_2() {
        let key = SymmetricKey([
            0xf8, 0x02, 0xf9, 0x81, 0x65, 0x4d, 0x24, 0xbb, 0xa8, 0x14, 0x97, 0xa6, 0x2e, 0x8b,
            0xa0, 0xbc,
        ]);
        let pseudonym: PseudonymisedUserId = [
            0xae, 0x24, 0xfa, 0xcc, 0x64, 0x06, 0xbf, 0x8f, 0x98, 0xd2, 0xcc, 0x45, 0x1f, 0x3b,
            0xa7, 0x3c,
        ];
        let expected: UserId = [
            0xaf, 0x55, 0x70, 0xf5, 0xa1, 0x81, 0x0b, 0x7a, 0xf7, 0x8c, 0xaf, 0x4b,
        ];
        assert_eq!(decrypt_pseudonym(&key, &pseudonym).unwrap(), expected);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let key = SymmetricKey::random();
        let pseudonym = encrypt_pseudonym(&key, &[5u8; 12]);
        let other = SymmetricKey::random();
        assert!(matches!(
            decrypt_pseudonym(&other, &pseudonym),
            Err(FootfallError::PseudonymCheckFailed)
        ));
    }

    proptest! {
        #[test]
        fn round_trip(key in any::<[u8; 16]>(), user in any::<[u8; 12]>()) {
            let key = SymmetricKey(key);
            let pseudonym = encrypt_pseudonym(&key, &user);
            prop_assert_eq!(decrypt_pseudonym(&key, &pseudonym).unwrap(), user);
        }

        #[test]
        fn any_corrupted_bit_is_rejected(
            key in any::<[u8; 16]>(),
            user in any::<[u8; 12]>(),
            bit in 0usize..128,
        ) {
            let key = SymmetricKey(key);
            let mut pseudonym = encrypt_pseudonym(&key, &user);
            pseudonym[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(decrypt_pseudonym(&key, &pseudonym).is_err());
        }
    }
}
