//! Block-wise authenticated-encrypted file.
//!
//! The on-disk layout is a 12-byte header followed by AES-128-GCM blocks:
//!
//! ```text
//! [Header: magic "FFEF" | version u16 | reserved u16 | nonce prefix u32]
//! [Block 0: ciphertext (<= 1 MiB plaintext) + 16-byte tag]
//! [Block 1: ...]
//! ```
//!
//! Every block except the last carries exactly [`BLOCK_BYTES`] bytes of
//! plaintext, which keeps the plaintext-offset → block mapping trivial for
//! seeks. The nonce of block `i` is `prefix || i` and `i` doubles as the
//! associated data, so blocks cannot be reordered or transplanted without
//! failing the tag check. Each footprint-state generation uses a fresh
//! random file key, so blocks cannot travel between generations either.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes128Gcm, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;

use footfall_crypto::SymmetricKey;
use footfall_error::{FootfallError, Result};
use footfall_types::params::FILE_BLOCK_BYTES;

use crate::{OpenMode, SequentialFile};

/// Plaintext bytes per block.
pub const BLOCK_BYTES: usize = FILE_BLOCK_BYTES;
/// AES-GCM authentication tag length.
const TAG_BYTES: usize = 16;
/// Stored ciphertext size of a full block.
const FULL_BLOCK_CIPHERTEXT_BYTES: usize = BLOCK_BYTES + TAG_BYTES;

const HEADER_BYTES: usize = 12;
const MAGIC: [u8; 4] = *b"FFEF";
const FORMAT_VERSION: u16 = 1;
const NONCE_PREFIX_OFFSET: usize = 8;

fn corrupt(path: &Path, detail: impl std::fmt::Display) -> FootfallError {
    FootfallError::integrity(format!("encrypted file '{}': {detail}", path.display()))
}

enum Inner {
    Reader {
        file: File,
        /// Plaintext cursor.
        position: u64,
        plaintext_size: u64,
        /// Index and contents of the currently decrypted block.
        cached_block: Option<(u64, Vec<u8>)>,
    },
    Writer {
        file: File,
        /// Pending plaintext, flushed in full blocks.
        pending: Vec<u8>,
        next_block_index: u64,
        bytes_written: u64,
        finished: bool,
    },
}

/// An authenticated-encrypted file of one footprint-state generation.
pub struct EncryptedFile {
    path: PathBuf,
    cipher: Aes128Gcm,
    nonce_prefix: u32,
    inner: Inner,
}

impl EncryptedFile {
    pub fn open(path: &Path, mode: OpenMode, key: &SymmetricKey) -> Result<Self> {
        let cipher = Aes128Gcm::new(key.as_bytes().into());
        match mode {
            OpenMode::ReadOnly => Self::open_reader(path, cipher),
            OpenMode::WriteOnly => Self::open_writer(path, cipher),
        }
    }

    fn open_reader(path: &Path, cipher: Aes128Gcm) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| FootfallError::BadInputFile {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_BYTES as u64 {
            return Err(corrupt(path, "missing header"));
        }

        let mut header = [0u8; HEADER_BYTES];
        file.read_exact(&mut header)?;
        if header[..4] != MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().expect("2-byte field"));
        if version != FORMAT_VERSION {
            return Err(corrupt(path, format!("unsupported version {version}")));
        }
        let nonce_prefix = u32::from_le_bytes(
            header[NONCE_PREFIX_OFFSET..NONCE_PREFIX_OFFSET + 4]
                .try_into()
                .expect("4-byte field"),
        );

        let ciphertext_size = file_size - HEADER_BYTES as u64;
        let full_blocks = ciphertext_size / FULL_BLOCK_CIPHERTEXT_BYTES as u64;
        let tail = ciphertext_size % FULL_BLOCK_CIPHERTEXT_BYTES as u64;
        if tail != 0 && tail <= TAG_BYTES as u64 {
            return Err(corrupt(path, "truncated final block"));
        }
        let plaintext_size = full_blocks * BLOCK_BYTES as u64 + tail.saturating_sub(TAG_BYTES as u64);

        Ok(Self {
            path: path.to_path_buf(),
            cipher,
            nonce_prefix,
            inner: Inner::Reader {
                file,
                position: 0,
                plaintext_size,
                cached_block: None,
            },
        })
    }

    fn open_writer(path: &Path, cipher: Aes128Gcm) -> Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let nonce_prefix = OsRng.next_u32();
        let mut header = [0u8; HEADER_BYTES];
        header[..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        header[NONCE_PREFIX_OFFSET..NONCE_PREFIX_OFFSET + 4]
            .copy_from_slice(&nonce_prefix.to_le_bytes());
        file.write_all(&header)?;

        Ok(Self {
            path: path.to_path_buf(),
            cipher,
            nonce_prefix,
            inner: Inner::Writer {
                file,
                pending: Vec::with_capacity(BLOCK_BYTES),
                next_block_index: 0,
                bytes_written: 0,
                finished: false,
            },
        })
    }

    fn nonce_for(&self, block_index: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&self.nonce_prefix.to_le_bytes());
        nonce[4..].copy_from_slice(&block_index.to_le_bytes());
        nonce
    }

    /// Plaintext position of the read or write cursor.
    pub fn tell(&self) -> u64 {
        match &self.inner {
            Inner::Reader { position, .. } => *position,
            Inner::Writer { bytes_written, .. } => *bytes_written,
        }
    }

    /// Move the read cursor. Only meaningful on read-only files.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let Inner::Reader {
            position,
            plaintext_size,
            ..
        } = &mut self.inner
        else {
            return Err(FootfallError::internal(
                "seek on a write-only encrypted file",
            ));
        };
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(offset) => i128::from(*plaintext_size) + i128::from(offset),
            SeekFrom::Current(offset) => i128::from(*position) + i128::from(offset),
        };
        if target < 0 || target > i128::from(*plaintext_size) {
            return Err(FootfallError::internal(format!(
                "seek target {target} outside file of {plaintext_size} bytes"
            )));
        }
        *position = target as u64;
        Ok(*position)
    }

    fn load_block(&mut self, block_index: u64) -> Result<()> {
        let nonce_bytes = self.nonce_for(block_index);
        let Inner::Reader {
            file,
            plaintext_size,
            cached_block,
            ..
        } = &mut self.inner
        else {
            return Err(FootfallError::internal("read on a write-only file"));
        };
        if matches!(cached_block, Some((cached, _)) if *cached == block_index) {
            return Ok(());
        }

        let block_start = block_index * BLOCK_BYTES as u64;
        let block_plain_len =
            (*plaintext_size - block_start).min(BLOCK_BYTES as u64) as usize;
        let mut ciphertext = vec![0u8; block_plain_len + TAG_BYTES];
        file.seek(SeekFrom::Start(
            HEADER_BYTES as u64 + block_index * FULL_BLOCK_CIPHERTEXT_BYTES as u64,
        ))?;
        file.read_exact(&mut ciphertext)?;

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &block_index.to_le_bytes(),
                },
            )
            .map_err(|_| corrupt(&self.path, format!("block {block_index} failed authentication")))?;

        let Inner::Reader { cached_block, .. } = &mut self.inner else {
            unreachable!("mode checked above");
        };
        *cached_block = Some((block_index, plaintext));
        Ok(())
    }

    fn flush_block(&mut self, plain: &[u8]) -> Result<()> {
        let Inner::Writer {
            next_block_index, ..
        } = &self.inner
        else {
            return Err(FootfallError::internal("write on a read-only file"));
        };
        let block_index = *next_block_index;
        let nonce_bytes = self.nonce_for(block_index);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plain,
                    aad: &block_index.to_le_bytes(),
                },
            )
            .map_err(|_| FootfallError::internal("AEAD encryption failed"))?;

        let Inner::Writer {
            file,
            next_block_index,
            ..
        } = &mut self.inner
        else {
            unreachable!("mode checked above");
        };
        file.write_all(&ciphertext)?;
        *next_block_index += 1;
        Ok(())
    }

    /// Delete a file; missing files are reported as errors to the caller,
    /// which treats cleanup as best-effort.
    pub fn remove(path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Ensure an openable (possibly empty) file exists at `path` without
    /// touching an existing one. A leftover file from an interrupted run
    /// is kept as-is; it is superseded, not trusted.
    pub fn create_empty_if_not_exists(path: &Path, key: &SymmetricKey) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        debug!(path = %path.display(), "creating empty encrypted file");
        let mut file = Self::open(path, OpenMode::WriteOnly, key)?;
        file.finish()
    }
}

impl SequentialFile for EncryptedFile {
    fn size(&mut self) -> Result<u64> {
        match &self.inner {
            Inner::Reader { plaintext_size, .. } => Ok(*plaintext_size),
            Inner::Writer { bytes_written, .. } => Ok(*bytes_written),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let (position, plaintext_size) = match &self.inner {
            Inner::Reader {
                position,
                plaintext_size,
                ..
            } => (*position, *plaintext_size),
            Inner::Writer { .. } => {
                return Err(FootfallError::internal("read on a write-only file"))
            }
        };
        if plaintext_size - position < buf.len() as u64 {
            return Err(FootfallError::ShortRead {
                expected: buf.len(),
                actual: (plaintext_size - position) as usize,
            });
        }

        let mut copied = 0;
        while copied < buf.len() {
            let pos = position + copied as u64;
            let block_index = pos / BLOCK_BYTES as u64;
            self.load_block(block_index)?;
            let Inner::Reader { cached_block, .. } = &self.inner else {
                unreachable!("mode checked above");
            };
            let (_, block) = cached_block.as_ref().expect("block just loaded");
            let offset = (pos % BLOCK_BYTES as u64) as usize;
            let n = (block.len() - offset).min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&block[offset..offset + n]);
            copied += n;
        }

        let Inner::Reader { position, .. } = &mut self.inner else {
            unreachable!("mode checked above");
        };
        *position += buf.len() as u64;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        {
            let Inner::Writer {
                pending,
                bytes_written,
                finished,
                ..
            } = &mut self.inner
            else {
                return Err(FootfallError::internal("write on a read-only file"));
            };
            if *finished {
                return Err(FootfallError::internal("write after finish"));
            }
            pending.extend_from_slice(buf);
            *bytes_written += buf.len() as u64;
        }

        loop {
            let Inner::Writer { pending, .. } = &mut self.inner else {
                unreachable!("mode checked above");
            };
            if pending.len() < BLOCK_BYTES {
                break;
            }
            let block: Vec<u8> = pending.drain(..BLOCK_BYTES).collect();
            self.flush_block(&block)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let tail = {
            let Inner::Writer {
                pending, finished, ..
            } = &mut self.inner
            else {
                return Err(FootfallError::internal("finish on a read-only file"));
            };
            if *finished {
                return Ok(());
            }
            *finished = true;
            std::mem::take(pending)
        };
        if !tail.is_empty() {
            self.flush_block(&tail)?;
        }
        let Inner::Writer { file, .. } = &mut self.inner else {
            unreachable!("mode checked above");
        };
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, key: &SymmetricKey, data: &[u8]) {
        let mut file = EncryptedFile::open(path, OpenMode::WriteOnly, key).unwrap();
        // Split the writes to exercise the chunking path.
        let mid = data.len() / 2;
        file.write_all(&data[..mid]).unwrap();
        file.write_all(&data[mid..]).unwrap();
        file.finish().unwrap();
    }

    #[test]
    fn round_trip_small() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        let data = b"sixteen byte msg + a little more".to_vec();
        write_file(&path, &key, &data);

        let mut file = EncryptedFile::open(&path, OpenMode::ReadOnly, &key).unwrap();
        assert_eq!(file.size().unwrap(), data.len() as u64);
        let mut out = vec![0u8; data.len()];
        file.read_exact(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn round_trip_across_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        // Two full blocks plus a tail.
        let data: Vec<u8> = (0..2 * BLOCK_BYTES + 1234).map(|i| (i % 251) as u8).collect();
        write_file(&path, &key, &data);

        let mut file = EncryptedFile::open(&path, OpenMode::ReadOnly, &key).unwrap();
        assert_eq!(file.size().unwrap(), data.len() as u64);
        let mut out = vec![0u8; data.len()];
        file.read_exact(&mut out).unwrap();
        assert_eq!(out, data);

        // Read a range straddling the first block boundary.
        file.seek(SeekFrom::Start(BLOCK_BYTES as u64 - 7)).unwrap();
        let mut straddle = [0u8; 14];
        file.read_exact(&mut straddle).unwrap();
        assert_eq!(&straddle[..], &data[BLOCK_BYTES - 7..BLOCK_BYTES + 7]);
        assert_eq!(file.tell(), BLOCK_BYTES as u64 + 7);
    }

    #[test]
    fn empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        EncryptedFile::create_empty_if_not_exists(&path, &key).unwrap();
        let mut file = EncryptedFile::open(&path, OpenMode::ReadOnly, &key).unwrap();
        assert_eq!(file.size().unwrap(), 0);

        // Creating again over the existing file is a no-op.
        EncryptedFile::create_empty_if_not_exists(&path, &key).unwrap();
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        write_file(&path, &key, b"state data");

        let mut file =
            EncryptedFile::open(&path, OpenMode::ReadOnly, &SymmetricKey::random()).unwrap();
        let mut out = [0u8; 10];
        let err = file.read_exact(&mut out).unwrap_err();
        assert!(matches!(err, FootfallError::Integrity { .. }));
    }

    #[test]
    fn flipped_ciphertext_byte_fails_authentication() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        write_file(&path, &key, b"state data");

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x40;
        std::fs::write(&path, &raw).unwrap();

        let mut file = EncryptedFile::open(&path, OpenMode::ReadOnly, &key).unwrap();
        let mut out = [0u8; 10];
        assert!(file.read_exact(&mut out).is_err());
    }

    #[test]
    fn short_read_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s_file0");
        let key = SymmetricKey::random();
        write_file(&path, &key, b"abc");

        let mut file = EncryptedFile::open(&path, OpenMode::ReadOnly, &key).unwrap();
        let mut out = [0u8; 4];
        assert!(matches!(
            file.read_exact(&mut out),
            Err(FootfallError::ShortRead {
                expected: 4,
                actual: 3
            })
        ));
    }
}
