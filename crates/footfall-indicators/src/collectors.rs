//! Streaming per-record collectors.
//!
//! All collectors that work per user rely on the merge feeding them each
//! user's records contiguously (the streams are sorted by (user, tile)),
//! so a change of user id closes the previous group.

use footfall_types::params::NUM_SUBPERIODS;
use footfall_types::{FootprintKey, TileIndex, UserId};

use crate::histogram::Log2Histogram;

/// Record and unique-user counters for one stream.
pub struct CountData {
    pub num_records: u64,
    pub num_unique_users: u64,
    pub records_per_user: Log2Histogram<10>,
}

/// Counts records and users, with a histogram of records per user.
pub struct RecordCount {
    data: CountData,
    representative: UserId,
    /// Zero only before the first record, at least 1 afterwards.
    group_size: u64,
}

impl RecordCount {
    pub fn new() -> Self {
        Self {
            data: CountData {
                num_records: 0,
                num_unique_users: 0,
                records_per_user: Log2Histogram::new(1, 1),
            },
            representative: UserId::default(),
            group_size: 0,
        }
    }

    pub fn record(&mut self, user: &UserId) {
        self.data.num_records += 1;
        if self.group_size == 0 {
            self.start_group(user);
        } else if *user == self.representative {
            self.group_size += 1;
        } else {
            self.finish_group();
            self.start_group(user);
        }
    }

    pub fn unique_users(&self) -> u64 {
        self.data.num_unique_users
    }

    pub fn finish(mut self) -> CountData {
        if self.group_size > 0 {
            self.finish_group();
        }
        self.data
    }

    fn start_group(&mut self, user: &UserId) {
        self.representative = *user;
        self.group_size = 1;
        self.data.num_unique_users += 1;
    }

    fn finish_group(&mut self) {
        self.data.records_per_user.record(self.group_size as f64);
    }
}

impl Default for RecordCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts update records by their subperiod presence pattern. Index bit 3
/// is subperiod 0 so the common "no aggregate presence" entries group
/// together.
#[derive(Default)]
pub struct SpatiotemporalDistribution {
    counts: [u64; 16],
}

impl SpatiotemporalDistribution {
    pub fn record(&mut self, values: &[f32; NUM_SUBPERIODS]) {
        let mut index = 0;
        if values[0] != 0.0 {
            index += 8;
        }
        if values[1] != 0.0 {
            index += 4;
        }
        if values[2] != 0.0 {
            index += 2;
        }
        if values[3] != 0.0 {
            index += 1;
        }
        self.counts[index] += 1;
    }

    pub fn finish(self) -> [u64; 16] {
        self.counts
    }
}

struct TileCount {
    histogram: Log2Histogram<10>,
    tiles_with_presence: u64,
}

/// Per subperiod, a histogram of the number of distinct tiles with
/// positive presence per user. (user, tile) uniqueness of the sorted
/// update stream makes every record a distinct tile.
pub struct UniqueTilesPerUser {
    first_invocation: bool,
    user: UserId,
    data: [TileCount; NUM_SUBPERIODS],
}

impl UniqueTilesPerUser {
    pub fn new() -> Self {
        Self {
            first_invocation: true,
            user: UserId::default(),
            data: std::array::from_fn(|_| TileCount {
                histogram: Log2Histogram::new(1, 1),
                tiles_with_presence: 0,
            }),
        }
    }

    pub fn record(&mut self, user: &UserId, values: &[f32; NUM_SUBPERIODS]) {
        if self.first_invocation {
            self.start_user(user);
            self.first_invocation = false;
        } else if *user != self.user {
            self.finish_user();
            self.start_user(user);
        }
        for (data, value) in self.data.iter_mut().zip(values) {
            if *value > 0.0 {
                data.tiles_with_presence += 1;
            }
        }
    }

    pub fn finish(mut self) -> [Log2Histogram<10>; NUM_SUBPERIODS] {
        if !self.first_invocation {
            self.finish_user();
        }
        self.data.map(|d| d.histogram)
    }

    fn start_user(&mut self, user: &UserId) {
        self.user = *user;
        for data in &mut self.data {
            data.tiles_with_presence = 0;
        }
    }

    fn finish_user(&mut self) {
        for data in &mut self.data {
            if data.tiles_with_presence > 0 {
                data.histogram.record(data.tiles_with_presence as f64);
            }
        }
    }
}

impl Default for UniqueTilesPerUser {
    fn default() -> Self {
        Self::new()
    }
}

/// Per subperiod, a histogram of raw presence weights, base 1/256.
pub struct WeightValueHistograms {
    histograms: [Log2Histogram<17>; NUM_SUBPERIODS],
}

impl WeightValueHistograms {
    pub fn new() -> Self {
        Self {
            histograms: std::array::from_fn(|_| Log2Histogram::new(1, 256)),
        }
    }

    pub fn record(&mut self, values: &[f32; NUM_SUBPERIODS]) {
        for (histogram, value) in self.histograms.iter_mut().zip(values) {
            histogram.record(f64::from(*value));
        }
    }

    pub fn finish(self) -> [Log2Histogram<17>; NUM_SUBPERIODS] {
        self.histograms
    }
}

impl Default for WeightValueHistograms {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default, Clone, Copy)]
struct WeightedMean {
    e: f64,
    n: f64,
    weight_sum: f64,
}

struct DistanceData {
    histogram: Log2Histogram<10>,
    update_mean: WeightedMean,
    accumulated_mean: WeightedMean,
}

/// Per subperiod, a histogram (base 256) of the distance between a user's
/// weighted centroid in this period's updates and in the accumulated
/// state. Users without presence on either side are skipped.
pub struct CentroidDistanceHistograms {
    first_invocation: bool,
    user: UserId,
    data: [DistanceData; NUM_SUBPERIODS],
}

enum MeanSide {
    Update,
    Accumulated,
}

impl CentroidDistanceHistograms {
    pub fn new() -> Self {
        Self {
            first_invocation: true,
            user: UserId::default(),
            data: std::array::from_fn(|_| DistanceData {
                histogram: Log2Histogram::new(256, 1),
                update_mean: WeightedMean::default(),
                accumulated_mean: WeightedMean::default(),
            }),
        }
    }

    pub fn record_update(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS]) {
        self.process(key, values, MeanSide::Update);
    }

    pub fn record_accumulated(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS]) {
        self.process(key, values, MeanSide::Accumulated);
    }

    pub fn finish(mut self) -> [Log2Histogram<10>; NUM_SUBPERIODS] {
        if !self.first_invocation {
            self.finish_user();
        }
        self.data.map(|d| d.histogram)
    }

    fn process(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS], side: MeanSide) {
        if self.first_invocation {
            self.start_user(&key.user);
            self.first_invocation = false;
        } else if key.user != self.user {
            self.finish_user();
            self.start_user(&key.user);
        }
        for (data, value) in self.data.iter_mut().zip(values) {
            let mean = match side {
                MeanSide::Update => &mut data.update_mean,
                MeanSide::Accumulated => &mut data.accumulated_mean,
            };
            mean.e += f64::from(*value) * f64::from(key.tile.easting);
            mean.n += f64::from(*value) * f64::from(key.tile.northing);
            mean.weight_sum += f64::from(*value);
        }
    }

    fn start_user(&mut self, user: &UserId) {
        self.user = *user;
        for data in &mut self.data {
            data.update_mean = WeightedMean::default();
            data.accumulated_mean = WeightedMean::default();
        }
    }

    fn finish_user(&mut self) {
        for data in &mut self.data {
            if data.update_mean.weight_sum == 0.0 || data.accumulated_mean.weight_sum == 0.0 {
                continue;
            }
            let u_e = data.update_mean.e / data.update_mean.weight_sum;
            let u_n = data.update_mean.n / data.update_mean.weight_sum;
            let a_e = data.accumulated_mean.e / data.accumulated_mean.weight_sum;
            let a_n = data.accumulated_mean.n / data.accumulated_mean.weight_sum;
            let distance = ((u_e - a_e).powi(2) + (u_n - a_n).powi(2)).sqrt();
            data.histogram.record(distance);
        }
    }
}

impl Default for CentroidDistanceHistograms {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct BoundingBox {
    low: TileIndex,
    high: TileIndex,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            low: TileIndex::new(u16::MAX, u16::MAX),
            high: TileIndex::new(u16::MIN, u16::MIN),
        }
    }
}

impl BoundingBox {
    fn extend(&mut self, tile: TileIndex) {
        self.low.easting = self.low.easting.min(tile.easting);
        self.low.northing = self.low.northing.min(tile.northing);
        self.high.easting = self.high.easting.max(tile.easting);
        self.high.northing = self.high.northing.max(tile.northing);
    }

    /// `-1.0` when no tile was added.
    fn diagonal_length(&self) -> f64 {
        if self.low.easting > self.high.easting || self.low.northing > self.high.northing {
            return -1.0;
        }
        let de = f64::from(self.high.easting - self.low.easting);
        let dn = f64::from(self.high.northing - self.low.northing);
        (de * de + dn * dn).sqrt()
    }
}

/// The three diagonal-length histograms of one subperiod.
pub struct SubperiodBoxes {
    pub update: Log2Histogram<8>,
    pub accumulated: Log2Histogram<8>,
    pub difference: Log2Histogram<8>,
}

struct BoxData {
    update_bb: BoundingBox,
    old_bb: BoundingBox,
    new_bb: BoundingBox,
    result: SubperiodBoxes,
}

/// Per subperiod, histograms (base 1024) of the diagonal length of the
/// bounding box of a user's tiles with non-zero presence: in the updates,
/// in the old state, and the difference between old and new state.
pub struct BoundingBoxHistograms {
    first_invocation: bool,
    user: UserId,
    data: [BoxData; NUM_SUBPERIODS],
}

enum BoxSide {
    Update,
    OldState,
    NewState,
}

impl BoundingBoxHistograms {
    pub fn new() -> Self {
        Self {
            first_invocation: true,
            user: UserId::default(),
            data: std::array::from_fn(|_| BoxData {
                update_bb: BoundingBox::default(),
                old_bb: BoundingBox::default(),
                new_bb: BoundingBox::default(),
                result: SubperiodBoxes {
                    update: Log2Histogram::new(1024, 1),
                    accumulated: Log2Histogram::new(1024, 1),
                    difference: Log2Histogram::new(1024, 1),
                },
            }),
        }
    }

    pub fn record_update(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS]) {
        self.process(key, values, BoxSide::Update);
    }

    pub fn record_old_state(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS]) {
        self.process(key, values, BoxSide::OldState);
    }

    pub fn record_new_state(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS]) {
        self.process(key, values, BoxSide::NewState);
    }

    pub fn finish(mut self) -> [SubperiodBoxes; NUM_SUBPERIODS] {
        if !self.first_invocation {
            self.finish_user();
        }
        self.data.map(|d| d.result)
    }

    fn process(&mut self, key: &FootprintKey, values: &[f32; NUM_SUBPERIODS], side: BoxSide) {
        if self.first_invocation {
            self.start_user(&key.user);
            self.first_invocation = false;
        } else if key.user != self.user {
            self.finish_user();
            self.start_user(&key.user);
        }
        for (data, value) in self.data.iter_mut().zip(values) {
            if *value == 0.0 {
                continue;
            }
            let bb = match side {
                BoxSide::Update => &mut data.update_bb,
                BoxSide::OldState => &mut data.old_bb,
                BoxSide::NewState => &mut data.new_bb,
            };
            bb.extend(key.tile);
        }
    }

    fn start_user(&mut self, user: &UserId) {
        self.user = *user;
        for data in &mut self.data {
            data.update_bb = BoundingBox::default();
            data.old_bb = BoundingBox::default();
            data.new_bb = BoundingBox::default();
        }
    }

    fn finish_user(&mut self) {
        for data in &mut self.data {
            let update = data.update_bb.diagonal_length();
            let old = data.old_bb.diagonal_length();
            let new = data.new_bb.diagonal_length();
            if update >= 0.0 {
                data.result.update.record(update);
            }
            if old >= 0.0 {
                data.result.accumulated.record(old);
            }
            if old >= 0.0 && new >= 0.0 {
                data.result.difference.record((old - new).abs());
            }
        }
    }
}

impl Default for BoundingBoxHistograms {
    fn default() -> Self {
        Self::new()
    }
}
