//! Report request and periodic key entry layouts.
//!
//! A report request arrives as one topic entry of exactly
//! [`ReportRequest::ENCODED_LEN`] bytes (17 000 032): two fixed-size tables
//! are always serialised at full capacity, with a leading count selecting
//! the live prefix. Layout, little-endian, no implicit padding:
//!
//! ```text
//! Offset      Size        Field
//!        0       4        first_period: u32
//!        4       4        last_period: u32
//!        8       8        with_calibration: u64 (0 or non-zero)
//!       16       8        num_reference_areas: u64
//!       24       5_000_000  reference_areas: 1_000_000 x {id: u8, tile: u16,u16}
//! 5_000_024      8        num_census_residents: u64
//! 5_000_032     12_000_000 census_residents: 1_000_000 x {tile: u16,u16, value: f64}
//! ```

use std::collections::{HashMap, HashSet};

use footfall_error::{FootfallError, Result};

use crate::params::{
    KEY_LEN, MAX_CENSUS_ENTRIES, MAX_REFERENCE_AREAS, MAX_REFERENCE_AREA_ENTRIES,
};
use crate::record::{
    read_f64_at, read_u16_at, read_u32_at, read_u64_at, write_f64_at, write_u16_at, write_u32_at,
    write_u64_at,
};
use crate::{Period, ReferenceAreaIndex, TileIndex};

const FIRST_PERIOD_OFFSET: usize = 0;
const LAST_PERIOD_OFFSET: usize = 4;
const WITH_CALIBRATION_OFFSET: usize = 8;
const NUM_REFERENCE_AREAS_OFFSET: usize = 16;
const REFERENCE_AREAS_OFFSET: usize = 24;
const REFERENCE_AREA_ENTRY_LEN: usize = 5;
const NUM_CENSUS_OFFSET: usize =
    REFERENCE_AREAS_OFFSET + MAX_REFERENCE_AREA_ENTRIES * REFERENCE_AREA_ENTRY_LEN;
const CENSUS_OFFSET: usize = NUM_CENSUS_OFFSET + 8;
const CENSUS_ENTRY_LEN: usize = 12;

/// One flattened `(area id, tile)` row of the reference-area table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceAreaEntry {
    pub id: ReferenceAreaIndex,
    pub tile: TileIndex,
}

/// The in-memory form of the reference-area table: area index → tile set.
pub type ReferenceAreas = Vec<HashSet<TileIndex>>;

/// The in-memory form of the census table: tile → resident count.
pub type CensusResidents = HashMap<TileIndex, f64>;

/// A report request from the statistical institute, decoded down to its
/// live table prefixes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReportRequest {
    pub first_period: Period,
    pub last_period: Period,
    pub with_calibration: bool,
    pub reference_areas: Vec<ReferenceAreaEntry>,
    pub census_residents: Vec<(TileIndex, f64)>,
}

impl ReportRequest {
    /// Exact serialised size of a request topic entry.
    pub const ENCODED_LEN: usize = CENSUS_OFFSET + MAX_CENSUS_ENTRIES * CENSUS_ENTRY_LEN;

    /// Decode and validate a request entry.
    ///
    /// Validation covers everything the state machine relies on later:
    /// period ordering, table caps, and reference-area well-formedness
    /// (contiguous ids starting from 0, at most
    /// [`MAX_REFERENCE_AREAS`] areas).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(FootfallError::bad_request(format!(
                "request entry has invalid size <{}>, expected <{}>",
                buf.len(),
                Self::ENCODED_LEN
            )));
        }

        let first_period = read_u32_at(buf, FIRST_PERIOD_OFFSET);
        let last_period = read_u32_at(buf, LAST_PERIOD_OFFSET);
        if first_period > last_period {
            return Err(FootfallError::bad_request(format!(
                "requested period is invalid, because the first period <{first_period}> \
                 is larger than the last period <{last_period}>"
            )));
        }

        let num_reference_areas = read_u64_at(buf, NUM_REFERENCE_AREAS_OFFSET);
        if num_reference_areas > MAX_REFERENCE_AREA_ENTRIES as u64 {
            return Err(FootfallError::bad_request(format!(
                "number of reference areas <{num_reference_areas}> is larger than allowed \
                 <{MAX_REFERENCE_AREA_ENTRIES}>"
            )));
        }

        let num_census = read_u64_at(buf, NUM_CENSUS_OFFSET);
        if num_census > MAX_CENSUS_ENTRIES as u64 {
            return Err(FootfallError::bad_request(format!(
                "number of census residents <{num_census}> is larger than allowed \
                 <{MAX_CENSUS_ENTRIES}>"
            )));
        }

        let mut reference_areas = Vec::with_capacity(num_reference_areas as usize);
        for i in 0..num_reference_areas as usize {
            let at = REFERENCE_AREAS_OFFSET + i * REFERENCE_AREA_ENTRY_LEN;
            reference_areas.push(ReferenceAreaEntry {
                id: buf[at],
                tile: TileIndex::new(read_u16_at(buf, at + 1), read_u16_at(buf, at + 3)),
            });
        }

        let mut census_residents = Vec::with_capacity(num_census as usize);
        for i in 0..num_census as usize {
            let at = CENSUS_OFFSET + i * CENSUS_ENTRY_LEN;
            census_residents.push((
                TileIndex::new(read_u16_at(buf, at), read_u16_at(buf, at + 2)),
                read_f64_at(buf, at + 4),
            ));
        }

        let request = Self {
            first_period,
            last_period,
            with_calibration: read_u64_at(buf, WITH_CALIBRATION_OFFSET) != 0,
            reference_areas,
            census_residents,
        };
        // Surface malformed area tables at digestion time, not mid-analysis.
        request.build_reference_areas()?;
        Ok(request)
    }

    /// Serialise at the full fixed capacity (tables zero-padded).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        write_u32_at(&mut buf, FIRST_PERIOD_OFFSET, self.first_period);
        write_u32_at(&mut buf, LAST_PERIOD_OFFSET, self.last_period);
        write_u64_at(
            &mut buf,
            WITH_CALIBRATION_OFFSET,
            u64::from(self.with_calibration),
        );
        write_u64_at(
            &mut buf,
            NUM_REFERENCE_AREAS_OFFSET,
            self.reference_areas.len() as u64,
        );
        for (i, entry) in self.reference_areas.iter().enumerate() {
            let at = REFERENCE_AREAS_OFFSET + i * REFERENCE_AREA_ENTRY_LEN;
            buf[at] = entry.id;
            write_u16_at(&mut buf, at + 1, entry.tile.easting);
            write_u16_at(&mut buf, at + 3, entry.tile.northing);
        }
        write_u64_at(&mut buf, NUM_CENSUS_OFFSET, self.census_residents.len() as u64);
        for (i, (tile, value)) in self.census_residents.iter().enumerate() {
            let at = CENSUS_OFFSET + i * CENSUS_ENTRY_LEN;
            write_u16_at(&mut buf, at, tile.easting);
            write_u16_at(&mut buf, at + 2, tile.northing);
            write_f64_at(&mut buf, at + 4, *value);
        }
        buf
    }

    /// Rebuild the reference-area tile sets from the flattened table.
    ///
    /// Entries with the same id must be contiguous, ids must start at 0 and
    /// increase by at most 1.
    pub fn build_reference_areas(&self) -> Result<ReferenceAreas> {
        let mut areas: ReferenceAreas = Vec::new();
        for entry in &self.reference_areas {
            let id = usize::from(entry.id);
            if id > areas.len() || areas.len() - id > 1 {
                return Err(FootfallError::bad_request(
                    "the reference area indices are invalid",
                ));
            }
            if id == areas.len() {
                if areas.len() == MAX_REFERENCE_AREAS {
                    return Err(FootfallError::bad_request(format!(
                        "too many reference areas (max {MAX_REFERENCE_AREAS})"
                    )));
                }
                areas.push(HashSet::from([entry.tile]));
            } else {
                areas
                    .last_mut()
                    .expect("non-empty by the contiguity check")
                    .insert(entry.tile);
            }
        }
        Ok(areas)
    }

    /// Rebuild the census map from the flattened table.
    pub fn build_census_residents(&self) -> CensusResidents {
        self.census_residents.iter().copied().collect()
    }
}

/// One entry of the periodic pseudonymisation key topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicKeyEntry {
    pub period: Period,
    pub key: [u8; KEY_LEN],
}

impl PeriodicKeyEntry {
    pub const ENCODED_LEN: usize = 4 + KEY_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return Err(FootfallError::integrity(format!(
                "periodic key entry has invalid size <{}>, expected <{}>",
                buf.len(),
                Self::ENCODED_LEN
            )));
        }
        Ok(Self {
            period: read_u32_at(buf, 0),
            key: buf[4..].try_into().expect("key field"),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::ENCODED_LEN];
        write_u32_at(&mut buf, 0, self.period);
        buf[4..].copy_from_slice(&self.key);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ReportRequest {
        ReportRequest {
            first_period: 5,
            last_period: 9,
            with_calibration: true,
            reference_areas: vec![
                ReferenceAreaEntry {
                    id: 0,
                    tile: TileIndex::new(10, 10),
                },
                ReferenceAreaEntry {
                    id: 0,
                    tile: TileIndex::new(10, 11),
                },
                ReferenceAreaEntry {
                    id: 1,
                    tile: TileIndex::new(40, 2),
                },
            ],
            census_residents: vec![
                (TileIndex::new(10, 10), 100.0),
                (TileIndex::new(40, 2), 12.5),
            ],
        }
    }

    #[test]
    fn entry_size_is_byte_exact() {
        assert_eq!(ReportRequest::ENCODED_LEN, 17_000_032);
    }

    #[test]
    fn request_round_trip() {
        let request = sample_request();
        assert_eq!(ReportRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn rejects_wrong_size() {
        assert!(ReportRequest::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn rejects_inverted_period_range() {
        let mut request = sample_request();
        request.first_period = 7;
        request.last_period = 3;
        let err = ReportRequest::decode(&request.encode()).unwrap_err();
        assert!(err.to_string().contains("first period <7>"));
    }

    #[test]
    fn rejects_gapped_area_ids() {
        let mut request = sample_request();
        request.reference_areas = vec![
            ReferenceAreaEntry {
                id: 1,
                tile: TileIndex::new(1, 1),
            },
            ReferenceAreaEntry {
                id: 3,
                tile: TileIndex::new(2, 2),
            },
        ];
        assert!(ReportRequest::decode(&request.encode()).is_err());
    }

    #[test]
    fn rejects_oversized_count_fields() {
        let mut buf = sample_request().encode();
        // Corrupt the census count beyond the table capacity.
        write_u64_at(&mut buf, NUM_CENSUS_OFFSET, MAX_CENSUS_ENTRIES as u64 + 1);
        let err = ReportRequest::decode(&buf).unwrap_err();
        assert!(err.to_string().contains("larger than allowed"));
    }

    #[test]
    fn builds_area_sets_and_census_map() {
        let request = sample_request();
        let areas = request.build_reference_areas().unwrap();
        assert_eq!(areas.len(), 2);
        assert!(areas[0].contains(&TileIndex::new(10, 11)));
        assert!(areas[1].contains(&TileIndex::new(40, 2)));

        let census = request.build_census_residents();
        assert_eq!(census[&TileIndex::new(10, 10)], 100.0);
    }

    #[test]
    fn area_ids_may_repeat_contiguously_only() {
        // `0, 0, 1, 1, 1` is legal; `0, 1, 0` is not.
        let mut request = sample_request();
        request.reference_areas = vec![
            ReferenceAreaEntry {
                id: 0,
                tile: TileIndex::new(1, 1),
            },
            ReferenceAreaEntry {
                id: 1,
                tile: TileIndex::new(2, 2),
            },
            ReferenceAreaEntry {
                id: 0,
                tile: TileIndex::new(3, 3),
            },
        ];
        assert!(request.build_reference_areas().is_err());
    }

    #[test]
    fn periodic_key_round_trip() {
        let entry = PeriodicKeyEntry {
            period: 42,
            key: [9u8; 16],
        };
        assert_eq!(
            PeriodicKeyEntry::decode(&entry.encode()).unwrap(),
            entry
        );
        assert!(PeriodicKeyEntry::decode(&[0u8; 19]).is_err());
    }
}
