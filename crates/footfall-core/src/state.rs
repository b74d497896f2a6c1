//! The persistent state machine record.
//!
//! One sealed record survives between invocations. It either waits for a
//! report request or tracks an accepted request across its period range,
//! together with the key and slot of the current footprint-state file.
//! The record is (de)serialised with an explicit little-endian layout and
//! must decode exactly; trailing or missing bytes mean the sealed blob
//! was swapped or truncated.

use std::path::{Path, PathBuf};

use footfall_crypto::SymmetricKey;
use footfall_error::{FootfallError, Result};
use footfall_store::SealedStore;
use footfall_types::params::KEY_LEN;
use footfall_types::request::ReferenceAreaEntry;
use footfall_types::{Period, ReportRequest, TileIndex};

/// File name of the sealed state record inside the data directory.
pub const STATE_FILE_NAME: &str = "state_file";
/// File name of the transient empty updates file used by manual finishing.
pub const DUMMY_H_FILE_NAME: &str = "dummy_h_file";

/// Path of a footprint-state file slot.
pub fn s_file_path(data_dir: &Path, slot: bool) -> PathBuf {
    data_dir.join(if slot { "s_file1" } else { "s_file0" })
}

const STATE_VERSION: u8 = 1;
const PHASE_AWAIT_REQUEST: u8 = 0;
const PHASE_AWAIT_H_FILES: u8 = 1;

/// What the next invocation is expected to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No active request; invocations scan the request topic.
    AwaitRequest,
    /// An accepted request is in flight; invocations feed update files
    /// period by period.
    AwaitHFiles {
        request: ReportRequest,
        next_expected_period: Period,
    },
}

/// The whole persistent state.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub phase: Phase,
    /// Request-topic entries already looked at (valid or skipped).
    pub last_seen_nsi_topic_size: u64,
    /// Key of the current footprint-state file; rotated on every update
    /// so files cannot be replayed across generations.
    pub s_file_key: SymmetricKey,
    /// Which of the two file slots is current.
    pub s_slot: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            phase: Phase::AwaitRequest,
            last_seen_nsi_topic_size: 0,
            s_file_key: SymmetricKey::zero(),
            s_slot: false,
        }
    }
}

impl State {
    /// Reset to waiting for a request, keeping the topic scan position.
    pub fn go_into_request_await(&mut self) {
        self.phase = Phase::AwaitRequest;
        self.s_slot = false;
    }

    /// Accept `request` and start expecting its first period, under a
    /// fresh footprint-file key.
    pub fn go_into_h_processing(&mut self, request: ReportRequest) {
        let first_period = request.first_period;
        self.phase = Phase::AwaitHFiles {
            request,
            next_expected_period: first_period,
        };
        self.s_file_key = SymmetricKey::random();
        self.s_slot = false;
    }

    /// Load the sealed state, or the zeroed initial state if none exists.
    pub fn load(store: &SealedStore) -> Result<Self> {
        match store.load()? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(Self::default()),
        }
    }

    /// Seal and overwrite the state file.
    pub fn store(&self, store: &SealedStore) -> Result<()> {
        store.store(&self.encode())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(STATE_VERSION);
        buf.push(match self.phase {
            Phase::AwaitRequest => PHASE_AWAIT_REQUEST,
            Phase::AwaitHFiles { .. } => PHASE_AWAIT_H_FILES,
        });
        buf.extend_from_slice(&self.last_seen_nsi_topic_size.to_le_bytes());
        buf.extend_from_slice(self.s_file_key.as_bytes());
        buf.push(u8::from(self.s_slot));

        if let Phase::AwaitHFiles {
            request,
            next_expected_period,
        } = &self.phase
        {
            buf.extend_from_slice(&next_expected_period.to_le_bytes());
            buf.extend_from_slice(&request.first_period.to_le_bytes());
            buf.extend_from_slice(&request.last_period.to_le_bytes());
            buf.push(u8::from(request.with_calibration));
            buf.extend_from_slice(&(request.reference_areas.len() as u64).to_le_bytes());
            for entry in &request.reference_areas {
                buf.push(entry.id);
                buf.extend_from_slice(&entry.tile.easting.to_le_bytes());
                buf.extend_from_slice(&entry.tile.northing.to_le_bytes());
            }
            buf.extend_from_slice(&(request.census_residents.len() as u64).to_le_bytes());
            for (tile, value) in &request.census_residents {
                buf.extend_from_slice(&tile.easting.to_le_bytes());
                buf.extend_from_slice(&tile.northing.to_le_bytes());
                buf.extend_from_slice(&value.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let version = cursor.u8()?;
        if version != STATE_VERSION {
            return Err(FootfallError::integrity(format!(
                "state record has unsupported version {version}"
            )));
        }
        let phase_tag = cursor.u8()?;
        let last_seen_nsi_topic_size = cursor.u64()?;
        let s_file_key = SymmetricKey(cursor.array::<KEY_LEN>()?);
        let s_slot = cursor.u8()? != 0;

        let phase = match phase_tag {
            PHASE_AWAIT_REQUEST => Phase::AwaitRequest,
            PHASE_AWAIT_H_FILES => {
                let next_expected_period = cursor.u32()?;
                let first_period = cursor.u32()?;
                let last_period = cursor.u32()?;
                let with_calibration = cursor.u8()? != 0;

                let num_areas = cursor.u64()?;
                let mut reference_areas = Vec::with_capacity(num_areas as usize);
                for _ in 0..num_areas {
                    reference_areas.push(ReferenceAreaEntry {
                        id: cursor.u8()?,
                        tile: TileIndex::new(cursor.u16()?, cursor.u16()?),
                    });
                }

                let num_census = cursor.u64()?;
                let mut census_residents = Vec::with_capacity(num_census as usize);
                for _ in 0..num_census {
                    census_residents.push((
                        TileIndex::new(cursor.u16()?, cursor.u16()?),
                        f64::from_le_bytes(cursor.array::<8>()?),
                    ));
                }

                Phase::AwaitHFiles {
                    request: ReportRequest {
                        first_period,
                        last_period,
                        with_calibration,
                        reference_areas,
                        census_residents,
                    },
                    next_expected_period,
                }
            }
            other => {
                return Err(FootfallError::integrity(format!(
                    "state record has unknown phase tag {other}"
                )))
            }
        };

        cursor.expect_exhausted()?;
        Ok(Self {
            phase,
            last_seen_nsi_topic_size,
            s_file_key,
            s_slot,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.at < n {
            return Err(FootfallError::integrity("state record is truncated"));
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array::<8>()?))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("length checked"))
    }

    fn expect_exhausted(&self) -> Result<()> {
        if self.at != self.buf.len() {
            return Err(FootfallError::integrity(format!(
                "state record carries {} unexpected trailing bytes",
                self.buf.len() - self.at
            )));
        }
        Ok(())
    }
}
