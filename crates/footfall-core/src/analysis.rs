//! The streaming analysis pipeline.
//!
//! One invocation pulls this period's pseudonymised updates and the
//! accumulated per-user state through a single merge:
//!
//! ```text
//! H file ─ de-pseudonymise ─ sort ─ clean ─ dedup ─┐
//!                                                  ├─ outer join ─ merge
//! S file (sorted, unique) ─────────────────────────┘        │
//!                              state update: ──── new S file┘
//!                              full analysis: quantise per user, rank,
//!                              attribute reference areas, anchor counts,
//!                              calibration weights, three reports
//! ```
//!
//! The merge output is sorted by (user, tile) with unique keys, which the
//! per-user grouping, the weight caching and the connection-strength
//! accumulation all rely on.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use footfall_crypto::{decrypt_pseudonym, SymmetricKey, Xoshiro256Plus};
use footfall_error::Result;
use footfall_indicators::IndicatorSet;
use footfall_store::{EncryptedFile, OpenMode, PlainFile};
use footfall_stream::{
    materialize, outer_join, sort_by, RecordSink, RecordSource, Source, SourceExt,
};
use footfall_types::params::{
    topics, DAY_QUANTISATION_THRESHOLD, SDC_THRESHOLD, SORT_RUN_BYTES,
    SUBPERIOD_QUANTISATION_THRESHOLD,
};
use footfall_types::request::{CensusResidents, ReferenceAreas};
use footfall_types::{
    encode_records, AccumulatedFootprint, FingerprintRecord, FootprintKey, FootprintUpdate,
    PseudonymisedFootprint, PseudonymisedUserId, QuantisedFootprint, Statistics, TotalFootprint,
    UserId,
};

use crate::aggregate::{
    build_calibration_weights, top_anchor_report, ConnectionStrengths, TopAnchorDistribution,
};
use crate::host::TaskOutputs;

/// How far one invocation takes the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perform {
    /// Merge the updates into the state file and stop.
    OnlyStateUpdate,
    /// Terminal period: run the whole analysis and emit the reports.
    FullAnalysis,
}

/// Everything one pipeline run consumes.
pub(crate) struct AnalysisRun {
    pub h_source: RecordSource<PseudonymisedFootprint, PlainFile>,
    pub s_source: RecordSource<AccumulatedFootprint, EncryptedFile>,
    /// Target slot; only created when a state update is actually written.
    pub s_out_path: PathBuf,
    pub s_out_key: SymmetricKey,
    pub pseudonymisation_key: SymmetricKey,
    pub what_to_do: Perform,
    pub reference_areas: ReferenceAreas,
    pub census_residents: CensusResidents,
    pub with_calibration: bool,
    pub rng: Xoshiro256Plus,
}

/// Record-flow counters, logged at debug level per run.
#[derive(Default, Clone, Copy)]
struct RecordFlow {
    h: u64,
    s_old: u64,
    s_new: u64,
    y: u64,
}

pub(crate) fn run(
    run: AnalysisRun,
    outputs: &mut dyn TaskOutputs,
    application_log: &mut String,
) -> Result<()> {
    let AnalysisRun {
        h_source,
        s_source,
        s_out_path,
        s_out_key,
        pseudonymisation_key,
        what_to_do,
        reference_areas,
        census_residents,
        with_calibration,
        mut rng,
    } = run;

    let indicators = RefCell::new(IndicatorSet::new());
    let flow = RefCell::new(RecordFlow::default());

    // De-pseudonymise. Consecutive records usually share a pseudonym, so
    // the last decryption is cached; the stream is not sorted yet, so this
    // is best-effort only.
    let mut last_seen: Option<(PseudonymisedUserId, UserId)> = None;
    let depseudonymised = h_source.try_map(move |record: PseudonymisedFootprint| {
        let user = match last_seen {
            Some((pseudonym, user)) if pseudonym == record.pseudonym => user,
            _ => {
                let user = decrypt_pseudonym(&pseudonymisation_key, &record.pseudonym)?;
                last_seen = Some((record.pseudonym, user));
                user
            }
        };
        Ok(FootprintUpdate {
            key: FootprintKey {
                user,
                tile: record.tile,
            },
            values: record.values,
        })
    });

    let sorted_updates = sort_by(depseudonymised, SORT_RUN_BYTES, |a, b| a.key.cmp(&b.key))?;

    // Drop garbage: non-finite or negative components, or nothing present.
    let cleaned = sorted_updates.filter(|update: &FootprintUpdate| {
        let mut positive_found = false;
        for value in update.values {
            if !value.is_finite() || value < 0.0 {
                return false;
            }
            if value > 0.0 {
                positive_found = true;
            }
        }
        positive_found
    });

    // In sane input each (user, tile) appears once; duplicates are folded
    // by component-wise maximum and counted.
    let deduplicated = cleaned
        .group_by(|a, b| a.key == b.key)
        .flat_map(|group: Vec<FootprintUpdate>, out: &mut Vec<FootprintUpdate>| {
            let mut merged = group[0];
            if group.len() > 1 {
                indicators
                    .borrow_mut()
                    .report_additional_h_duplicates(group.len() as u64 - 1);
                for duplicate in &group[1..] {
                    for (value, other) in merged.values.iter_mut().zip(duplicate.values) {
                        *value = value.max(other);
                    }
                }
            }
            out.push(merged);
        });

    // The merge: updates and state are both sorted by (user, tile) with
    // unique keys, so the join pairs at most one record per side and its
    // output upholds the same invariant.
    let merged_state = outer_join(
        deduplicated,
        s_source,
        |update: &FootprintUpdate| update.key,
        |state: &AccumulatedFootprint| state.key,
    )
    .map(|(update, state)| {
        let mut indicators = indicators.borrow_mut();
        let mut flow = flow.borrow_mut();
        let result = match (update, state) {
            (None, Some(state)) => {
                indicators.process_s_old_record(&state);
                flow.s_old += 1;
                state
            }
            (Some(update), None) => {
                indicators.process_h_record(&update);
                flow.h += 1;
                AccumulatedFootprint::from(update)
            }
            (Some(update), Some(mut state)) => {
                indicators.process_h_record(&update);
                indicators.process_s_old_record(&state);
                flow.h += 1;
                flow.s_old += 1;
                for (value, addend) in state.values.iter_mut().zip(update.values) {
                    *value += addend;
                }
                state
            }
            (None, None) => unreachable!("the outer join emits at least one side"),
        };
        indicators.process_s_new_record(&result);
        flow.s_new += 1;
        result
    });

    if what_to_do == Perform::OnlyStateUpdate {
        let out_file = EncryptedFile::open(&s_out_path, OpenMode::WriteOnly, &s_out_key)?;
        let mut sink = RecordSink::new(out_file, &s_out_path);
        let mut merged_state = merged_state;
        while let Some(record) = merged_state.next()? {
            sink.push(&record)?;
        }
        sink.finish()?;
        drop(merged_state);

        log_record_flow(flow.into_inner());
        indicators.into_inner().render(application_log);
        return Ok(());
    }

    // Full analysis: the request is fulfilled after this run, so the new
    // state is never written.

    let statistics = RefCell::new(Statistics::default());
    let top_anchor_dist: RefCell<TopAnchorDistribution> = RefCell::new(HashMap::new());

    let quantised = merged_state
        .group_by(|a, b| a.key.user == b.key.user)
        .flat_map(
            |footprints: Vec<AccumulatedFootprint>, out: &mut Vec<QuantisedFootprint>| {
                quantise_user(
                    footprints,
                    out,
                    &mut rng,
                    &mut statistics.borrow_mut(),
                    &reference_areas,
                );
            },
        )
        .inspect(|footprint: &QuantisedFootprint| {
            if footprint.rank == QuantisedFootprint::FIRST_RANK {
                *top_anchor_dist
                    .borrow_mut()
                    .entry(footprint.key.tile)
                    .or_insert(0) += 1;
            }
            flow.borrow_mut().y += 1;
        });

    // The anchor distribution must be complete before weights exist, so
    // the quantised stream is driven to disk here.
    let materialised = materialize(quantised)?;

    let top_anchor_dist = top_anchor_dist.into_inner();
    let mut statistics = statistics.into_inner();
    let weights = build_calibration_weights(
        &mut statistics,
        &census_residents,
        &top_anchor_dist,
        with_calibration,
    );

    // All records of a user group share the weight of the group's anchor
    // tile; the anchor (rank 0) leads its group through the stream.
    let mut group_weight = 0.0f64;
    let weighted = materialised.map(|mut footprint: QuantisedFootprint| {
        if !with_calibration {
            // Neutral for the multiplications downstream.
            footprint.calibration_weight = 1.0;
            return footprint;
        }
        if footprint.rank == QuantisedFootprint::FIRST_RANK {
            group_weight = weights.get(&footprint.key.tile).copied().unwrap_or(0.0);
        }
        footprint.calibration_weight = group_weight;
        footprint
    });

    let mut connection_strengths = ConnectionStrengths::new(&reference_areas);
    let observed = weighted.inspect(|footprint| connection_strengths.record(footprint));

    // Sum the per-tile footprint. Many users can share a tile, so this is
    // a sort plus an O(1)-memory fold rather than a grouping.
    let by_tile = sort_by(observed, SORT_RUN_BYTES, |a, b| {
        a.key.tile.cmp(&b.key.tile)
    })?;
    let fingerprint: Vec<FingerprintRecord> = by_tile
        .squash(
            |a, b| a.key.tile == b.key.tile,
            |first| TotalFootprint {
                tile: first.key.tile,
                values: [0.0; 4],
            },
            |total: &mut TotalFootprint, footprint| {
                for (value, present) in total.values.iter_mut().zip(footprint.bitmap) {
                    // calibration_weight is 1.0 when calibration is off.
                    *value += footprint.calibration_weight * f64::from(u8::from(present));
                }
            },
        )
        .map(|mut total: TotalFootprint| {
            for value in &mut total.values {
                if *value < SDC_THRESHOLD {
                    *value = 0.0;
                }
            }
            FingerprintRecord {
                tile: total.tile,
                values: total.values,
            }
        })
        .collect_vec()?;
    outputs.put(topics::FINGERPRINT_REPORT, &encode_records(&fingerprint))?;

    outputs.put(
        topics::FUNCTIONAL_URBAN_FINGERPRINT_REPORT,
        &encode_records(&connection_strengths.finish()),
    )?;

    outputs.put(
        topics::TOP_ANCHOR_DISTRIBUTION_REPORT,
        &encode_records(&top_anchor_report(&top_anchor_dist)),
    )?;

    outputs.put(topics::STATISTICS, &encode_records(&[statistics]))?;

    log_record_flow(flow.into_inner());
    indicators.into_inner().render(application_log);
    Ok(())
}

/// Quantise one user's accumulated footprint: drop weak tiles, rank the
/// rest, derive the presence bitmaps, and attribute reference areas.
fn quantise_user(
    mut footprints: Vec<AccumulatedFootprint>,
    out: &mut Vec<QuantisedFootprint>,
    rng: &mut Xoshiro256Plus,
    statistics: &mut Statistics,
    reference_areas: &ReferenceAreas,
) {
    footprints.retain(|footprint| footprint.values[0] >= DAY_QUANTISATION_THRESHOLD);
    if footprints.is_empty() {
        statistics.highly_nomadic_users += 1;
        return;
    }
    let user = footprints[0].key.user;

    // Rank descending by presence; ties resolve through a random side key
    // so the tile layout cannot bias the anchor choice.
    let mut ranked: Vec<(AccumulatedFootprint, u128)> = footprints
        .into_iter()
        .map(|footprint| (footprint, rng.next_tie_break()))
        .collect();
    ranked.sort_unstable_by(|(a, tie_a), (b, tie_b)| {
        let a_key = (a.values[0], a.values[1].max(a.values[2]).max(a.values[3]));
        let b_key = (b.values[0], b.values[1].max(b.values[2]).max(b.values[3]));
        b_key
            .0
            .total_cmp(&a_key.0)
            .then_with(|| b_key.1.total_cmp(&a_key.1))
            .then_with(|| b.values[1].total_cmp(&a.values[1]))
            .then_with(|| tie_b.cmp(tie_a))
    });

    out.reserve(ranked.len());
    for (rank, (footprint, _)) in ranked.into_iter().enumerate() {
        let mut bitmap = [true; 4];
        for (bit, value) in bitmap.iter_mut().zip(footprint.values).skip(1) {
            *bit = value / footprint.values[0] >= SUBPERIOD_QUANTISATION_THRESHOLD;
        }
        out.push(QuantisedFootprint {
            key: FootprintKey {
                user,
                tile: footprint.key.tile,
            },
            bitmap,
            rank: rank as u32 + QuantisedFootprint::FIRST_RANK,
            area_bits: 0,
            calibration_weight: 0.0,
        });
    }

    // A user belongs to reference area `k` if any of their quantised
    // tiles lies in it; the group shares one membership bitset.
    let mut area_bits = 0u128;
    for (area_index, area) in reference_areas.iter().enumerate() {
        if out.iter().any(|q| area.contains(&q.key.tile)) {
            area_bits |= 1 << area_index;
        }
    }
    for footprint in out.iter_mut() {
        footprint.area_bits = area_bits;
    }
}

fn log_record_flow(flow: RecordFlow) {
    debug!(
        h_records = flow.h,
        s_old_records = flow.s_old,
        s_new_records = flow.s_new,
        y_records = flow.y,
        "record flow"
    );
}
