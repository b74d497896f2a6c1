//! Final aggregations: calibration weights, connection strengths and the
//! top-anchor distribution.

use std::collections::HashMap;

use footfall_types::params::SDC_THRESHOLD;
use footfall_types::request::{CensusResidents, ReferenceAreas};
use footfall_types::{
    ConnectionStrengthRecord, QuantisedFootprint, ReferenceAreaIndex, Statistics, TileIndex,
    TopAnchorRecord,
};

/// Users anchored per tile, filled while the quantised stream is first
/// materialised. Not SDC-filtered; the report derives from it.
pub type TopAnchorDistribution = HashMap<TileIndex, u32>;

/// Per-tile calibration weight derived from census residents versus
/// observed anchors. Also accumulates the user-count statistics, which are
/// reported with or without calibration; with calibration disabled every
/// weight is the neutral 1 and the returned map stays empty.
pub fn build_calibration_weights(
    statistics: &mut Statistics,
    residents: &CensusResidents,
    top_anchor_dist: &TopAnchorDistribution,
    with_calibration: bool,
) -> HashMap<TileIndex, f64> {
    let mut weights = HashMap::new();
    if with_calibration {
        weights.reserve(top_anchor_dist.len());
    }

    for (&tile, &count) in top_anchor_dist {
        // Every tile in the distribution was somebody's anchor, so the
        // anchor count is at least 1 and the ratio below is well-defined.
        let anchor_count = f64::from(count);
        let resident_count = residents.get(&tile).copied().unwrap_or(0.0);
        let weight = if !with_calibration {
            1.0
        } else {
            let max_count = resident_count.max(anchor_count);
            let ratio = resident_count / anchor_count;
            if max_count < 10.0 {
                1.0
            } else if ratio <= 0.2 {
                0.2
            } else if ratio >= 10.0 {
                10.0
            } else {
                ratio
            }
        };
        if with_calibration {
            weights.insert(tile, weight);
        }

        statistics.observed_total_users += count;
        statistics.adjusted_total_users += weight * anchor_count;
    }
    weights
}

/// SDC-filtered top-anchor report rows (unsorted).
pub fn top_anchor_report(top_anchor_dist: &TopAnchorDistribution) -> Vec<TopAnchorRecord> {
    top_anchor_dist
        .iter()
        .filter(|(_, &count)| f64::from(count) >= SDC_THRESHOLD)
        .map(|(&tile, &count)| TopAnchorRecord { tile, count })
        .collect()
}

#[derive(Default, Clone, Copy)]
struct ConnectionOperand {
    /// Weighted users having both this tile and the reference area in
    /// their usual environment.
    numerator: f64,
    /// Weighted users having this tile in their usual environment.
    denominator: f64,
}

/// Accumulates connection strengths between each reference area and every
/// tile outside of it.
pub struct ConnectionStrengths<'a> {
    reference_areas: &'a ReferenceAreas,
    operands: HashMap<(ReferenceAreaIndex, TileIndex), ConnectionOperand>,
}

impl<'a> ConnectionStrengths<'a> {
    pub fn new(reference_areas: &'a ReferenceAreas) -> Self {
        Self {
            reference_areas,
            operands: HashMap::new(),
        }
    }

    pub fn record(&mut self, footprint: &QuantisedFootprint) {
        for (area_index, area) in self.reference_areas.iter().enumerate() {
            // Only tiles outside the area measure its pull.
            if area.contains(&footprint.key.tile) {
                continue;
            }
            let operand = self
                .operands
                .entry((area_index as ReferenceAreaIndex, footprint.key.tile))
                .or_default();
            let member = (footprint.area_bits >> area_index) & 1;
            // calibration_weight is 1.0 when calibration is disabled.
            operand.numerator += member as f64 * footprint.calibration_weight;
            operand.denominator += footprint.calibration_weight;
        }
    }

    /// SDC-filtered report rows (unsorted). Strengths are only emitted
    /// with a numerator above the disclosure threshold and a strength
    /// distinguishable from zero.
    pub fn finish(self) -> Vec<ConnectionStrengthRecord> {
        let mut result = Vec::with_capacity(self.operands.len());
        for ((area, tile), operand) in &self.operands {
            let strength = operand.numerator / operand.denominator;
            if operand.numerator >= SDC_THRESHOLD && strength > 1e-20 {
                result.push(ConnectionStrengthRecord {
                    area: *area,
                    tile: *tile,
                    strength,
                });
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use footfall_types::FootprintKey;
    use std::collections::HashSet;

    #[test]
    fn calibration_weight_branches_in_order() {
        let mut residents = CensusResidents::new();
        residents.insert(TileIndex::new(0, 0), 5.0); // both small -> 1
        residents.insert(TileIndex::new(1, 0), 2.0); // ratio 2/20 <= 0.2 -> 0.2
        residents.insert(TileIndex::new(2, 0), 500.0); // ratio 500/20 >= 10 -> 10
        residents.insert(TileIndex::new(3, 0), 60.0); // ratio 3 -> 3

        let mut dist = TopAnchorDistribution::new();
        dist.insert(TileIndex::new(0, 0), 5);
        dist.insert(TileIndex::new(1, 0), 20);
        dist.insert(TileIndex::new(2, 0), 20);
        dist.insert(TileIndex::new(3, 0), 20);
        // No census entry at all: residents 0, max = anchors.
        dist.insert(TileIndex::new(4, 0), 40);

        let mut statistics = Statistics::default();
        let weights = build_calibration_weights(&mut statistics, &residents, &dist, true);
        assert_eq!(weights[&TileIndex::new(0, 0)], 1.0);
        assert_eq!(weights[&TileIndex::new(1, 0)], 0.2);
        assert_eq!(weights[&TileIndex::new(2, 0)], 10.0);
        assert_eq!(weights[&TileIndex::new(3, 0)], 3.0);
        assert_eq!(weights[&TileIndex::new(4, 0)], 0.2);

        assert_eq!(statistics.observed_total_users, 105);
        let expected_adjusted = 5.0 + 0.2 * 20.0 + 10.0 * 20.0 + 3.0 * 20.0 + 0.2 * 40.0;
        assert!((statistics.adjusted_total_users - expected_adjusted).abs() < 1e-9);
    }

    #[test]
    fn disabled_calibration_keeps_statistics_but_no_weights() {
        let mut dist = TopAnchorDistribution::new();
        dist.insert(TileIndex::new(0, 0), 3);
        dist.insert(TileIndex::new(1, 0), 4);

        let mut statistics = Statistics::default();
        let weights =
            build_calibration_weights(&mut statistics, &CensusResidents::new(), &dist, false);
        assert!(weights.is_empty());
        assert_eq!(statistics.observed_total_users, 7);
        assert_eq!(statistics.adjusted_total_users, 7.0);
    }

    #[test]
    fn top_anchor_report_applies_sdc() {
        let mut dist = TopAnchorDistribution::new();
        dist.insert(TileIndex::new(0, 0), 0);
        dist.insert(TileIndex::new(1, 0), 1);
        let report = top_anchor_report(&dist);
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].tile, TileIndex::new(1, 0));
    }

    fn quantised(tile: TileIndex, area_bits: u128, weight: f64) -> QuantisedFootprint {
        QuantisedFootprint {
            key: FootprintKey {
                user: [1; 12],
                tile,
            },
            bitmap: [true, false, false, false],
            rank: 0,
            area_bits,
            calibration_weight: weight,
        }
    }

    #[test]
    fn connection_strengths_skip_inside_tiles_and_filter() {
        let inside = TileIndex::new(0, 0);
        let outside = TileIndex::new(5, 5);
        let areas: ReferenceAreas = vec![HashSet::from([inside])];

        let mut strengths = ConnectionStrengths::new(&areas);
        // Inside tile: ignored entirely.
        strengths.record(&quantised(inside, 1, 1.0));
        // Two users at the outside tile, one belonging to the area.
        strengths.record(&quantised(outside, 1, 1.0));
        strengths.record(&quantised(outside, 0, 1.0));

        let report = strengths.finish();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].area, 0);
        assert_eq!(report[0].tile, outside);
        assert!((report[0].strength - 0.5).abs() < 1e-12);
    }

    #[test]
    fn connection_strengths_below_threshold_are_suppressed() {
        let areas: ReferenceAreas = vec![HashSet::from([TileIndex::new(0, 0)])];
        let outside = TileIndex::new(5, 5);

        // Numerator 0.5 < 1: suppressed even though the strength is large.
        let mut strengths = ConnectionStrengths::new(&areas);
        strengths.record(&quantised(outside, 1, 0.5));
        assert!(strengths.finish().is_empty());

        // Members absent everywhere: strength 0, suppressed.
        let mut strengths = ConnectionStrengths::new(&areas);
        strengths.record(&quantised(outside, 0, 2.0));
        assert!(strengths.finish().is_empty());
    }
}
