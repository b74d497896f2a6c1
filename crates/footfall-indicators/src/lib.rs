//! Streaming k-anonymised run indicators.
//!
//! [`IndicatorSet`] rides along the merge of the update and state streams,
//! counting and measuring without ever influencing the reports. Everything
//! is written to the application log in one block at the end of the run,
//! with counts below the anonymity threshold masked, and the whole block
//! suppressed when the run is too small to mask safely.

pub mod collectors;
pub mod histogram;

use std::fmt::Write;

use footfall_types::params::indicators_k_anonymity;
use footfall_types::{AccumulatedFootprint, FootprintUpdate};

use collectors::{
    BoundingBoxHistograms, CentroidDistanceHistograms, RecordCount, SpatiotemporalDistribution,
    UniqueTilesPerUser, WeightValueHistograms,
};
pub use histogram::{k_anonymize, Log2Histogram};

/// All indicator collectors of one invocation.
pub struct IndicatorSet {
    duplicate_h_records: u64,

    h_count: RecordCount,
    s_old_count: RecordCount,
    s_new_count: RecordCount,

    spatiotemporal: SpatiotemporalDistribution,

    unique_tiles: UniqueTilesPerUser,
    h_weights: WeightValueHistograms,
    s_old_weights: WeightValueHistograms,
    distances: CentroidDistanceHistograms,
    bounding_boxes: BoundingBoxHistograms,
}

impl IndicatorSet {
    pub fn new() -> Self {
        Self {
            duplicate_h_records: 0,
            h_count: RecordCount::new(),
            s_old_count: RecordCount::new(),
            s_new_count: RecordCount::new(),
            spatiotemporal: SpatiotemporalDistribution::default(),
            unique_tiles: UniqueTilesPerUser::new(),
            h_weights: WeightValueHistograms::new(),
            s_old_weights: WeightValueHistograms::new(),
            distances: CentroidDistanceHistograms::new(),
            bounding_boxes: BoundingBoxHistograms::new(),
        }
    }

    /// Extra records folded away by the per-(user, tile) deduplication.
    pub fn report_additional_h_duplicates(&mut self, additional_duplicates: u64) {
        self.duplicate_h_records += additional_duplicates;
    }

    pub fn process_h_record(&mut self, record: &FootprintUpdate) {
        self.h_count.record(&record.key.user);
        self.spatiotemporal.record(&record.values);
        self.unique_tiles.record(&record.key.user, &record.values);
        self.h_weights.record(&record.values);
        self.distances.record_update(&record.key, &record.values);
        self.bounding_boxes.record_update(&record.key, &record.values);
    }

    pub fn process_s_old_record(&mut self, record: &AccumulatedFootprint) {
        self.s_old_count.record(&record.key.user);
        self.s_old_weights.record(&record.values);
        self.distances.record_accumulated(&record.key, &record.values);
        self.bounding_boxes
            .record_old_state(&record.key, &record.values);
    }

    pub fn process_s_new_record(&mut self, record: &AccumulatedFootprint) {
        self.s_new_count.record(&record.key.user);
        self.bounding_boxes
            .record_new_state(&record.key, &record.values);
    }

    /// Render the indicator block into the application log.
    pub fn render(self, log: &mut String) {
        self.render_with_k(log, indicators_k_anonymity());
    }

    pub fn render_with_k(self, log: &mut String, k: u64) {
        log.push('\n');

        // Enough unique users must be present to lessen the risk that the
        // masked NA values can be reconstructed from the rolling
        // percentage numbers. `1000`: the histogram rolling percentage is
        // printed with one digit after the decimal point (`100.0 %`).
        if self.h_count.unique_users().min(self.s_new_count.unique_users()) < k * 1000 {
            log.push_str("The indicators are omitted because the user count is too small.\n");
            return;
        }

        let _ = writeln!(
            log,
            "Number of duplicate records in the H file: {}",
            self.duplicate_h_records
        );
        log.push('\n');

        let h_count = self.h_count.finish();
        let s_old_count = self.s_old_count.finish();
        let s_new_count = self.s_new_count.finish();
        for (what, count) in [
            ("H", &h_count),
            ("Old S", &s_old_count),
            ("New S", &s_new_count),
        ] {
            let _ = writeln!(
                log,
                "{what}:\n\tNumber of unique users in file: {}\n\tNumber of records in file: {}\n\tHistogram of Number of records per user:",
                count.num_unique_users, count.num_records
            );
            count.records_per_user.render_into(log, "\t\t", k);
        }
        log.push('\n');

        log.push_str(
            "Histogram: count of H records with given subperiod pattern (subperiod order in \
             pattern 0,1,2,3). 0 in pattern position i means given subperiod i had weight 0 in \
             given record, 1 means weight >0. :\n",
        );
        for (pattern, count) in self.spatiotemporal.finish().iter().enumerate() {
            let _ = write!(log, "\t{pattern:04b}: ");
            k_anonymize(*count, k, log);
            log.push('\n');
        }
        log.push('\n');

        for (subperiod, histogram) in self.unique_tiles.finish().iter().enumerate() {
            let _ = writeln!(
                log,
                "H histogram of number of unique tiles per user (with presence > 0) for subperiod {subperiod}:"
            );
            histogram.render_into(log, "\t", k);
        }
        log.push('\n');

        let h_weights = self.h_weights.finish();
        let s_old_weights = self.s_old_weights.finish();
        for (what, histograms) in [("H", &h_weights), ("Old S", &s_old_weights)] {
            for (subperiod, histogram) in histograms.iter().enumerate() {
                let _ = writeln!(log, "{what} histogram of weight values in subperiod {subperiod}:");
                histogram.render_into(log, "\t", k);
            }
        }
        log.push('\n');

        for (subperiod, histogram) in self.distances.finish().iter().enumerate() {
            let _ = writeln!(
                log,
                "Histogram of distance between user H and old S average position in subperiod {subperiod}:"
            );
            histogram.render_into(log, "\t", k);
        }

        let boxes = self.bounding_boxes.finish();
        type BoxSelector = fn(&collectors::SubperiodBoxes) -> &Log2Histogram<8>;
        let sections: [(&str, BoxSelector); 3] = [
            (
                "Histogram of user tiles bounding box diagonal length in H",
                |b| &b.update,
            ),
            (
                "Histogram of user tiles bounding box diagonal length in old S",
                |b| &b.accumulated,
            ),
            (
                "Histogram of user tiles bounding box diagonal length difference between old S and new S",
                |b| &b.difference,
            ),
        ];
        for (what, select) in sections {
            log.push('\n');
            for (subperiod, subperiod_boxes) in boxes.iter().enumerate() {
                let _ = writeln!(log, "{what} in subperiod {subperiod}:");
                select(subperiod_boxes).render_into(log, "\t", k);
            }
        }
    }
}

impl Default for IndicatorSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use footfall_types::params::NUM_SUBPERIODS;
    use footfall_types::{FootprintKey, TileIndex};

    fn update(user: u8, tile: u16, values: [f32; NUM_SUBPERIODS]) -> FootprintUpdate {
        FootprintUpdate {
            key: FootprintKey {
                user: [user; 12],
                tile: TileIndex::new(tile, tile),
            },
            values,
        }
    }

    fn state(user: u8, tile: u16, values: [f32; NUM_SUBPERIODS]) -> AccumulatedFootprint {
        AccumulatedFootprint {
            key: FootprintKey {
                user: [user; 12],
                tile: TileIndex::new(tile, tile),
            },
            values,
        }
    }

    #[test]
    fn small_runs_are_suppressed_entirely() {
        let mut indicators = IndicatorSet::new();
        indicators.process_h_record(&update(1, 1, [5.0, 1.0, 0.0, 0.0]));
        indicators.process_s_new_record(&state(1, 1, [5.0, 1.0, 0.0, 0.0]));

        let mut log = String::new();
        indicators.render_with_k(&mut log, 20);
        assert_eq!(
            log,
            "\nThe indicators are omitted because the user count is too small.\n"
        );
    }

    #[test]
    fn large_runs_render_every_section() {
        let mut indicators = IndicatorSet::new();
        indicators.report_additional_h_duplicates(3);
        // k = 1 still requires 1000 unique users on both sides.
        for i in 0..1000u16 {
            let user = [i as u8, (i >> 8) as u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            let record = FootprintUpdate {
                key: FootprintKey {
                    user,
                    tile: TileIndex::new(i, i),
                },
                values: [12.0, 6.0, 0.0, 1.0],
            };
            indicators.process_h_record(&record);
            indicators.process_s_old_record(&state_from(record));
            indicators.process_s_new_record(&state_from(record));
        }

        let mut log = String::new();
        indicators.render_with_k(&mut log, 1);
        assert!(log.contains("Number of duplicate records in the H file: 3"));
        assert!(log.contains("H:\n\tNumber of unique users in file: 1000"));
        assert!(log.contains("New S:"));
        assert!(log.contains("\t1101: 1000\n"));
        assert!(log.contains("H histogram of number of unique tiles per user"));
        assert!(log.contains("Old S histogram of weight values in subperiod 3:"));
        assert!(log.contains(
            "Histogram of distance between user H and old S average position in subperiod 0:"
        ));
        assert!(log.contains(
            "Histogram of user tiles bounding box diagonal length difference between old S and \
             new S in subperiod 0:"
        ));
    }

    fn state_from(record: FootprintUpdate) -> AccumulatedFootprint {
        AccumulatedFootprint {
            key: record.key,
            values: record.values,
        }
    }

    #[test]
    fn masked_counts_render_as_na() {
        let mut log = String::new();
        k_anonymize(19, 20, &mut log);
        log.push(' ');
        k_anonymize(20, 20, &mut log);
        assert_eq!(log, "NA 20");
    }
}
