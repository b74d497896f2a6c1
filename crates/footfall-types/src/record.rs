//! Pipeline record types and their fixed-layout codecs.
//!
//! Every record that crosses a file or topic boundary implements
//! [`FixedRecord`]: a constant encoded size and infallible little-endian
//! (de)serialisation with no implicit padding. Whole-file shape errors
//! (a size that is not a multiple of the record size) are detected by the
//! file sources, not here.

use crate::params::{NUM_SUBPERIODS, PSEUDONYM_LEN, USER_ID_LEN};
use crate::{PseudonymisedUserId, TileIndex, UserId};

/// A record with a fixed byte-exact layout.
///
/// `encode_into` and `decode` expect a slice of exactly
/// [`FixedRecord::ENCODED_LEN`] bytes; anything else is a caller bug.
pub trait FixedRecord: Sized {
    const ENCODED_LEN: usize;

    fn encode_into(&self, buf: &mut [u8]);
    fn decode(buf: &[u8]) -> Self;
}

// ── little-endian field helpers ─────────────────────────────────────

pub(crate) fn read_u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().expect("2-byte field"))
}

pub(crate) fn read_u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte field"))
}

pub(crate) fn read_u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().expect("8-byte field"))
}

pub(crate) fn read_f32_at(buf: &[u8], at: usize) -> f32 {
    f32::from_le_bytes(buf[at..at + 4].try_into().expect("4-byte field"))
}

pub(crate) fn read_f64_at(buf: &[u8], at: usize) -> f64 {
    f64::from_le_bytes(buf[at..at + 8].try_into().expect("8-byte field"))
}

pub(crate) fn write_u16_at(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u32_at(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64_at(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_f32_at(buf: &mut [u8], at: usize, v: f32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_f64_at(buf: &mut [u8], at: usize, v: f64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

impl FixedRecord for TileIndex {
    const ENCODED_LEN: usize = 4;

    fn encode_into(&self, buf: &mut [u8]) {
        write_u16_at(buf, 0, self.easting);
        write_u16_at(buf, 2, self.northing);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            easting: read_u16_at(buf, 0),
            northing: read_u16_at(buf, 2),
        }
    }
}

fn encode_values(values: &[f32; NUM_SUBPERIODS], buf: &mut [u8], at: usize) {
    for (i, v) in values.iter().enumerate() {
        write_f32_at(buf, at + i * 4, *v);
    }
}

fn decode_values(buf: &[u8], at: usize) -> [f32; NUM_SUBPERIODS] {
    let mut values = [0.0f32; NUM_SUBPERIODS];
    for (i, v) in values.iter_mut().enumerate() {
        *v = read_f32_at(buf, at + i * 4);
    }
    values
}

/// One still-pseudonymised observation from an uploaded footprint file:
/// (pseudonym, tile, presence weight per subperiod).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PseudonymisedFootprint {
    pub pseudonym: PseudonymisedUserId,
    pub tile: TileIndex,
    pub values: [f32; NUM_SUBPERIODS],
}

impl FixedRecord for PseudonymisedFootprint {
    const ENCODED_LEN: usize = PSEUDONYM_LEN + 4 + NUM_SUBPERIODS * 4;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..PSEUDONYM_LEN].copy_from_slice(&self.pseudonym);
        self.tile.encode_into(&mut buf[PSEUDONYM_LEN..PSEUDONYM_LEN + 4]);
        encode_values(&self.values, buf, PSEUDONYM_LEN + 4);
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            pseudonym: buf[..PSEUDONYM_LEN].try_into().expect("pseudonym field"),
            tile: TileIndex::decode(&buf[PSEUDONYM_LEN..PSEUDONYM_LEN + 4]),
            values: decode_values(buf, PSEUDONYM_LEN + 4),
        }
    }
}

/// The (user, tile) key of the cumulative footprint matrix.
///
/// The derived ordering (user id bytes, then tile) is the one total order
/// shared by the sorted footprint streams and the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FootprintKey {
    pub user: UserId,
    pub tile: TileIndex,
}

/// A de-pseudonymised observation, pre-merge. Same shape as
/// [`AccumulatedFootprint`] but kept as its own type so the two sides of
/// the merge cannot be mixed up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FootprintUpdate {
    pub key: FootprintKey,
    pub values: [f32; NUM_SUBPERIODS],
}

/// The cumulative per-(user, tile) footprint, persisted encrypted between
/// invocations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccumulatedFootprint {
    pub key: FootprintKey,
    pub values: [f32; NUM_SUBPERIODS],
}

impl From<FootprintUpdate> for AccumulatedFootprint {
    fn from(update: FootprintUpdate) -> Self {
        Self {
            key: update.key,
            values: update.values,
        }
    }
}

macro_rules! keyed_values_codec {
    ($ty:ty) => {
        impl FixedRecord for $ty {
            const ENCODED_LEN: usize = USER_ID_LEN + 4 + NUM_SUBPERIODS * 4;

            fn encode_into(&self, buf: &mut [u8]) {
                buf[..USER_ID_LEN].copy_from_slice(&self.key.user);
                self.key
                    .tile
                    .encode_into(&mut buf[USER_ID_LEN..USER_ID_LEN + 4]);
                encode_values(&self.values, buf, USER_ID_LEN + 4);
            }

            fn decode(buf: &[u8]) -> Self {
                Self {
                    key: FootprintKey {
                        user: buf[..USER_ID_LEN].try_into().expect("user id field"),
                        tile: TileIndex::decode(&buf[USER_ID_LEN..USER_ID_LEN + 4]),
                    },
                    values: decode_values(buf, USER_ID_LEN + 4),
                }
            }
        }
    };
}

keyed_values_codec!(FootprintUpdate);
keyed_values_codec!(AccumulatedFootprint);

/// A per-(user, tile) record after quantisation: presence bitmap, the
/// tile's rank within the user's footprint, the user's reference-area
/// membership bits and the calibration weight shared by the user's group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantisedFootprint {
    pub key: FootprintKey,
    pub bitmap: [bool; NUM_SUBPERIODS],
    pub rank: u32,
    /// Bit `k` set: some tile of this user's footprint lies in reference
    /// area `k`. Width bounded by `MAX_REFERENCE_AREAS == 128`.
    pub area_bits: u128,
    pub calibration_weight: f64,
}

impl QuantisedFootprint {
    /// Rank of the user's top-weighted (anchor) tile.
    pub const FIRST_RANK: u32 = 0;
}

impl FixedRecord for QuantisedFootprint {
    // user + tile + bitmap byte + rank + area bits + weight
    const ENCODED_LEN: usize = USER_ID_LEN + 4 + 1 + 4 + 16 + 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[..USER_ID_LEN].copy_from_slice(&self.key.user);
        self.key
            .tile
            .encode_into(&mut buf[USER_ID_LEN..USER_ID_LEN + 4]);
        let mut mask = 0u8;
        for (i, set) in self.bitmap.iter().enumerate() {
            if *set {
                mask |= 1 << i;
            }
        }
        buf[USER_ID_LEN + 4] = mask;
        write_u32_at(buf, USER_ID_LEN + 5, self.rank);
        buf[USER_ID_LEN + 9..USER_ID_LEN + 25].copy_from_slice(&self.area_bits.to_le_bytes());
        write_f64_at(buf, USER_ID_LEN + 25, self.calibration_weight);
    }

    fn decode(buf: &[u8]) -> Self {
        let mask = buf[USER_ID_LEN + 4];
        let mut bitmap = [false; NUM_SUBPERIODS];
        for (i, set) in bitmap.iter_mut().enumerate() {
            *set = mask & (1 << i) != 0;
        }
        Self {
            key: FootprintKey {
                user: buf[..USER_ID_LEN].try_into().expect("user id field"),
                tile: TileIndex::decode(&buf[USER_ID_LEN..USER_ID_LEN + 4]),
            },
            bitmap,
            rank: read_u32_at(buf, USER_ID_LEN + 5),
            area_bits: u128::from_le_bytes(
                buf[USER_ID_LEN + 9..USER_ID_LEN + 25]
                    .try_into()
                    .expect("area bits field"),
            ),
            calibration_weight: read_f64_at(buf, USER_ID_LEN + 25),
        }
    }
}

/// Concatenate `records` into one packed buffer (topic payloads).
pub fn encode_records<T: FixedRecord>(records: &[T]) -> Vec<u8> {
    let mut buf = vec![0u8; records.len() * T::ENCODED_LEN];
    for (record, chunk) in records.iter().zip(buf.chunks_exact_mut(T::ENCODED_LEN)) {
        record.encode_into(chunk);
    }
    buf
}

/// Split a packed buffer back into records; the buffer must be an exact
/// multiple of the record size.
pub fn decode_records<T: FixedRecord>(buf: &[u8]) -> footfall_error::Result<Vec<T>> {
    if buf.len() % T::ENCODED_LEN != 0 {
        return Err(footfall_error::FootfallError::integrity(format!(
            "packed record buffer of {} bytes is not a multiple of the record size {}",
            buf.len(),
            T::ENCODED_LEN
        )));
    }
    Ok(buf.chunks_exact(T::ENCODED_LEN).map(T::decode).collect())
}

/// Per-tile aggregation accumulator of the fingerprint report. In-memory
/// only, one or two instances live at a time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TotalFootprint {
    pub tile: TileIndex,
    pub values: [f64; NUM_SUBPERIODS],
}
