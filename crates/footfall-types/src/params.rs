//! Tuning parameters, size caps and interface names.
//!
//! The analysis thresholds come from the methodology document driving this
//! system; the caps bound the fully-in-memory tables of a report request.

/// Subperiods per record. Subperiod 0 is the aggregate over subperiods 1..3.
pub const NUM_SUBPERIODS: usize = 4;

/// ψ: a user/tile pair below this aggregate presence is dropped before
/// ranking.
pub const DAY_QUANTISATION_THRESHOLD: f32 = 10.0;

/// φ: a subperiod counts as present when its share of the aggregate reaches
/// this ratio.
pub const SUBPERIOD_QUANTISATION_THRESHOLD: f32 = 0.5;

/// ξ: small-cell disclosure-control threshold applied to all three reports.
pub const SDC_THRESHOLD: f64 = 1.0;

/// Indicator counts below k are printed as [`INDICATORS_K_REPLACEMENT`].
/// Development builds disable the masking so fixtures stay readable.
pub const fn indicators_k_anonymity() -> u64 {
    if cfg!(debug_assertions) {
        1
    } else {
        20
    }
}

/// Replacement string for k-anonymised indicator counts.
pub const INDICATORS_K_REPLACEMENT: &str = "NA";

/// Bytes of a stable user identifier (truncated SHA-256).
pub const USER_ID_LEN: usize = 12;
/// Bytes of the pseudonym HMAC tag.
pub const HMAC_TAG_LEN: usize = 4;
/// Bytes of a pseudonymised user identifier (one AES block).
pub const PSEUDONYM_LEN: usize = USER_ID_LEN + HMAC_TAG_LEN;
/// Bytes of symmetric key material (pseudonymisation and file keys).
pub const KEY_LEN: usize = 16;

/// Reference areas per request; also the width of the per-user area bitset.
pub const MAX_REFERENCE_AREAS: usize = 128;
/// Flattened (area id, tile) entries per request.
pub const MAX_REFERENCE_AREA_ENTRIES: usize = 1_000_000;
/// (tile, residents) entries per request.
pub const MAX_CENSUS_ENTRIES: usize = 1_000_000;

/// In-memory run budget of the external sorts.
pub const SORT_RUN_BYTES: usize = 64 * 1024 * 1024;

/// Chunk size of buffered record file reads and writes.
pub const FILE_BLOCK_BYTES: usize = 1024 * 1024;

/// Input topic names.
pub mod topics {
    /// `ReportRequest` entries uploaded by the statistical institute.
    pub const NSI_INPUT: &str = "nsi_input";
    /// `{period, key}` entries from the periodic key issuer.
    pub const PERIODIC_PSEUDONYMISATION_KEY: &str = "periodic_pseudonymisation_key";

    /// Per-tile total footprint report.
    pub const FINGERPRINT_REPORT: &str = "fingerprint_report";
    /// Connection strengths between reference areas and outside tiles.
    pub const FUNCTIONAL_URBAN_FINGERPRINT_REPORT: &str = "functional_urban_fingerprint_report";
    /// Count of users anchored at each tile.
    pub const TOP_ANCHOR_DISTRIBUTION_REPORT: &str = "top_anchor_distribution_report";
    /// Scalar run statistics.
    pub const STATISTICS: &str = "statistics";
    /// Free-form UTF-8 run diary.
    pub const APPLICATION_LOG: &str = "application_log";
}

/// Recognised invocation argument names.
pub mod arguments {
    /// Discard the current report request; the value is ignored.
    pub const CANCEL: &str = "cancel";
    /// Force terminal-period processing from accumulated state only.
    pub const FINISH_REPORT: &str = "finish-report";
    /// Path of the footprint-updates file to process.
    pub const FILE: &str = "file";
    /// Period the supplied file belongs to, as a decimal integer.
    pub const PERIOD: &str = "period";
}
