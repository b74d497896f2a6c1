//! The sealed state record.
//!
//! The persistent state machine record is stored through an authenticated
//! encryption bound to a fixed associated-data tag. The sealing key is
//! supplied by the hosting environment and is expected to be bound to the
//! exact build of the trusted core, so state written by one build cannot
//! be opened by another. The tag is a stable constant: rotating it would
//! orphan every sealed state in the field.
//!
//! Layout: `magic "FFSL" | version u16 | nonce [12] | ciphertext+tag`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::info;

use footfall_crypto::SymmetricKey;
use footfall_error::{FootfallError, Result};

/// Associated-data tag of the one sealed record this system keeps.
pub const STATE_AAD: &[u8] = b"analysis_enclave_state_file";

const MAGIC: [u8; 4] = *b"FFSL";
const FORMAT_VERSION: u16 = 1;
const NONCE_BYTES: usize = 12;
const HEADER_BYTES: usize = 4 + 2 + NONCE_BYTES;

/// Reads and overwrites the sealed state file.
pub struct SealedStore {
    path: PathBuf,
    cipher: Aes128Gcm,
}

impl SealedStore {
    pub fn new(path: PathBuf, sealing_key: &SymmetricKey) -> Self {
        Self {
            path,
            cipher: Aes128Gcm::new(sealing_key.as_bytes().into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and authenticate the sealed record. `None` if no state file
    /// exists yet (the caller starts from a zeroed state).
    pub fn load(&self) -> Result<Option<Vec<u8>>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no state file, starting from a fresh state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < HEADER_BYTES || raw[..4] != MAGIC {
            return Err(FootfallError::integrity("state file has no valid header"));
        }
        let version = u16::from_le_bytes(raw[4..6].try_into().expect("2-byte field"));
        if version != FORMAT_VERSION {
            return Err(FootfallError::integrity(format!(
                "state file has unsupported version {version}"
            )));
        }

        let nonce = Nonce::from_slice(&raw[6..6 + NONCE_BYTES]);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &raw[HEADER_BYTES..],
                    aad: STATE_AAD,
                },
            )
            .map_err(|_| FootfallError::integrity("failed to unseal the state file"))?;
        Ok(Some(plaintext))
    }

    /// Seal `plaintext` and overwrite the state file.
    pub fn store(&self, plaintext: &[u8]) -> Result<()> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: STATE_AAD,
                },
            )
            .map_err(|_| FootfallError::internal("AEAD encryption failed"))?;

        let mut file = File::create(&self.path)?;
        file.write_all(&MAGIC)?;
        file.write_all(&FORMAT_VERSION.to_le_bytes())?;
        file.write_all(&nonce_bytes)?;
        file.write_all(&ciphertext)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_file_loads_as_none() {
        let dir = tempdir().unwrap();
        let store = SealedStore::new(dir.path().join("state_file"), &SymmetricKey::random());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn round_trip_and_overwrite() {
        let dir = tempdir().unwrap();
        let store = SealedStore::new(dir.path().join("state_file"), &SymmetricKey::random());
        store.store(b"generation 1").unwrap();
        assert_eq!(store.load().unwrap().unwrap(), b"generation 1");
        store.store(b"generation 2, longer payload").unwrap();
        assert_eq!(store.load().unwrap().unwrap(), b"generation 2, longer payload");
    }

    #[test]
    fn wrong_sealing_key_is_an_integrity_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state_file");
        SealedStore::new(path.clone(), &SymmetricKey::random())
            .store(b"state")
            .unwrap();
        let err = SealedStore::new(path, &SymmetricKey::random())
            .load()
            .unwrap_err();
        assert!(matches!(err, FootfallError::Integrity { .. }));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state_file");
        let key = SymmetricKey::random();
        SealedStore::new(path.clone(), &key).store(b"state").unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&path, &raw).unwrap();

        assert!(SealedStore::new(path, &key).load().is_err());
    }
}
