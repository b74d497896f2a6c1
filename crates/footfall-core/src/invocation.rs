//! Per-invocation dispatch through the persistent state machine.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use footfall_crypto::SymmetricKey;
use footfall_error::{FootfallError, Result};
use footfall_store::{EncryptedFile, OpenMode, PlainFile, SealedStore, SequentialFile};
use footfall_stream::RecordSource;
use footfall_types::params::{arguments, topics};
use footfall_types::{Period, PeriodicKeyEntry, ReportRequest};

use crate::analysis::{self, AnalysisRun, Perform};
use crate::host::{RuntimeEnv, TaskInputs, TaskOutputs};
use crate::state::{s_file_path, Phase, State, DUMMY_H_FILE_NAME, STATE_FILE_NAME};

/// Run one invocation: load the sealed state, dispatch on phase and
/// arguments, store the new state, clean up superseded files, and emit
/// the application log.
///
/// On error nothing is stored and no outputs are emitted, so a failed
/// invocation has no visible effect beyond its diagnostic.
pub fn run_invocation(
    env: &RuntimeEnv,
    inputs: &dyn TaskInputs,
    outputs: &mut dyn TaskOutputs,
) -> Result<()> {
    info!("running footfall analytics invocation");
    let mut application_log = String::new();

    let store = SealedStore::new(env.data_dir.join(STATE_FILE_NAME), &env.sealing_key);
    let mut state = State::load(&store)?;
    let mut old_s_files_to_delete = Vec::new();

    process_state(
        env,
        &mut state,
        inputs,
        outputs,
        &mut old_s_files_to_delete,
        &mut application_log,
    )?;

    state.store(&store)?;

    // The state now points past these files; leftovers from a failed
    // removal are harmless and get cleaned up by a later run.
    for path in old_s_files_to_delete {
        if let Err(error) = EncryptedFile::remove(&path) {
            warn!(path = %path.display(), %error, "could not remove superseded state file");
        }
    }

    outputs.put(topics::APPLICATION_LOG, application_log.as_bytes())
}

fn process_state(
    env: &RuntimeEnv,
    state: &mut State,
    inputs: &dyn TaskInputs,
    outputs: &mut dyn TaskOutputs,
    old_s_files_to_delete: &mut Vec<std::path::PathBuf>,
    application_log: &mut String,
) -> Result<()> {
    match &state.phase {
        Phase::AwaitRequest => {
            if !inputs.arguments().is_empty() {
                return Err(FootfallError::invalid_arguments(
                    "no arguments are expected when awaiting a new NSI report request, \
                     but arguments were supplied",
                ));
            }
            digest_report_requests(state, inputs, application_log)
        }
        Phase::AwaitHFiles { .. } => {
            if inputs.argument(arguments::CANCEL).is_some() {
                if inputs.arguments().len() != 1 {
                    return Err(FootfallError::invalid_arguments(format!(
                        "found the <{}> argument - when this argument is supplied, no other \
                         arguments shall be supplied, yet other arguments were found",
                        arguments::CANCEL
                    )));
                }
                return process_cancel(env, state, old_s_files_to_delete, application_log);
            }

            if inputs.argument(arguments::FINISH_REPORT).is_some() {
                if inputs.arguments().len() != 1 {
                    return Err(FootfallError::invalid_arguments(format!(
                        "found the <{}> argument - when this argument is supplied, no other \
                         arguments shall be supplied, yet other arguments were found",
                        arguments::FINISH_REPORT
                    )));
                }
                return process_manual_finish(
                    env,
                    state,
                    outputs,
                    old_s_files_to_delete,
                    application_log,
                );
            }

            let Some(h_file) = inputs.argument(arguments::FILE) else {
                return Err(FootfallError::invalid_arguments(format!(
                    "expected argument <{}>, but it is missing",
                    arguments::FILE
                )));
            };
            let Some(period_argument) = inputs.argument(arguments::PERIOD) else {
                return Err(FootfallError::invalid_arguments(format!(
                    "expected argument <{}>, but it is missing",
                    arguments::PERIOD
                )));
            };
            if inputs.arguments().len() != 2 {
                return Err(FootfallError::invalid_arguments(format!(
                    "found the <{}> and <{}> arguments - when these arguments are supplied, \
                     no other arguments shall be supplied, yet other arguments were found",
                    arguments::FILE,
                    arguments::PERIOD
                )));
            }

            let period = parse_period(period_argument)?;
            process_h_file(
                env,
                state,
                inputs,
                outputs,
                old_s_files_to_delete,
                application_log,
                Path::new(h_file),
                period,
            )
        }
    }
}

fn parse_period(argument: &str) -> Result<Period> {
    let value: u64 = argument.parse().map_err(|_| {
        FootfallError::invalid_arguments(format!(
            "argument <{}> is not a decimal integer: <{argument}>",
            arguments::PERIOD
        ))
    })?;
    u32::try_from(value)
        .map_err(|_| FootfallError::invalid_arguments("period number too large"))
}

fn log_request_arguments(request: &ReportRequest, application_log: &mut String) {
    let _ = writeln!(
        application_log,
        "With calibration: {}",
        request.with_calibration
    );
    let _ = writeln!(
        application_log,
        "First period: {}, last period: {}",
        request.first_period, request.last_period
    );
}

fn log_skipped_periods(
    first_skipped_inclusive: u64,
    last_skipped_exclusive: u64,
    application_log: &mut String,
) {
    for skipped in first_skipped_inclusive..last_skipped_exclusive {
        let _ = writeln!(application_log, "Skipped period {skipped}");
    }
}

/// Scan the request topic from the last seen position for a new valid
/// request; invalid entries are logged and skipped so the core cannot get
/// stuck on one bad upload.
fn digest_report_requests(
    state: &mut State,
    inputs: &dyn TaskInputs,
    application_log: &mut String,
) -> Result<()> {
    let Some(topic_entries) = inputs.topic(topics::NSI_INPUT) else {
        application_log
            .push_str("Waited for new NSI request, nothing came, going back to sleep.\n");
        info!("waited for a new NSI request, nothing came");
        return Ok(());
    };
    if state.last_seen_nsi_topic_size >= topic_entries.len() as u64 {
        application_log
            .push_str("Waited for new NSI request, nothing came, going back to sleep.\n");
        info!("waited for a new NSI request, nothing came");
        return Ok(());
    }

    for (id, entry) in topic_entries
        .iter()
        .enumerate()
        .skip(state.last_seen_nsi_topic_size as usize)
    {
        match ReportRequest::decode(entry) {
            Ok(request) => {
                state.last_seen_nsi_topic_size = id as u64 + 1;
                application_log.push_str("New NSI request arrived.\n");
                log_request_arguments(&request, application_log);
                info!(
                    first_period = request.first_period,
                    last_period = request.last_period,
                    "new NSI report request accepted"
                );
                state.go_into_h_processing(request);
                return Ok(());
            }
            Err(error) => {
                let _ = writeln!(
                    application_log,
                    "Failed to look at NSI report request with data id {id}, skipping.\n\
                     \tError message: {error}"
                );
                warn!(data_id = id, %error, "skipping invalid NSI report request");
            }
        }
    }

    application_log.push_str("No new valid NSI request found.\n");
    // Remember the whole scan so the same invalid requests are not logged
    // over and over. A later valid request still gets found because it
    // arrives behind this mark.
    state.last_seen_nsi_topic_size = topic_entries.len() as u64;
    Ok(())
}

fn read_h_metadata_file(h_file: &Path, application_log: &mut String) -> Result<()> {
    let mut metadata_path = h_file.as_os_str().to_owned();
    metadata_path.push(".meta");
    let metadata = PlainFile::read_to_string(Path::new(&metadata_path))?;
    application_log.push_str("\nH metadata:\n");
    application_log.push_str(&metadata);
    application_log.push('\n');
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn process_h_file(
    env: &RuntimeEnv,
    state: &mut State,
    inputs: &dyn TaskInputs,
    outputs: &mut dyn TaskOutputs,
    old_s_files_to_delete: &mut Vec<std::path::PathBuf>,
    application_log: &mut String,
    h_file: &Path,
    given_period: Period,
) -> Result<()> {
    let Phase::AwaitHFiles {
        request,
        next_expected_period,
    } = &state.phase
    else {
        return Err(FootfallError::internal("H processing outside a request"));
    };
    let request = request.clone();
    let next_expected_period = *next_expected_period;
    let max_expected_period = request.last_period;

    read_h_metadata_file(h_file, application_log)?;

    if given_period < next_expected_period || given_period > max_expected_period {
        return Err(FootfallError::PeriodOutOfRange {
            given: given_period,
            lo: next_expected_period,
            hi: max_expected_period,
        });
    }

    log_request_arguments(&request, application_log);
    let _ = writeln!(application_log, "Expected next period: {next_expected_period}");
    log_skipped_periods(
        u64::from(next_expected_period),
        u64::from(given_period),
        application_log,
    );

    let pseudonymisation_key = find_periodic_key(inputs, given_period)?;

    let s_file_in_path = s_file_path(&env.data_dir, state.s_slot);
    let s_file_out_path = s_file_path(&env.data_dir, !state.s_slot);
    // The state file being consumed now is superseded once this
    // invocation commits.
    state.s_slot = !state.s_slot;
    old_s_files_to_delete.push(s_file_in_path.clone());

    // First period of a request: there is no state file yet, reading an
    // empty one is equivalent.
    EncryptedFile::create_empty_if_not_exists(&s_file_in_path, &state.s_file_key)?;

    let what_to_do = if given_period < max_expected_period {
        Perform::OnlyStateUpdate
    } else {
        Perform::FullAnalysis
    };

    let h_source = RecordSource::new(PlainFile::open(h_file, OpenMode::ReadOnly)?, h_file)?;
    if h_source.is_empty_file() {
        return Err(FootfallError::invalid_arguments(format!(
            "the supplied H file <{}> holds no records (use <{}> to finish the report from \
             accumulated state)",
            h_file.display(),
            arguments::FINISH_REPORT
        )));
    }
    let s_source = RecordSource::new(
        EncryptedFile::open(&s_file_in_path, OpenMode::ReadOnly, &state.s_file_key)?,
        &s_file_in_path,
    )?;

    let new_s_file_key = SymmetricKey::random();
    let start = Instant::now();
    analysis::run(
        AnalysisRun {
            h_source,
            s_source,
            s_out_path: s_file_out_path.clone(),
            s_out_key: new_s_file_key,
            pseudonymisation_key,
            what_to_do,
            reference_areas: request.build_reference_areas()?,
            census_residents: request.build_census_residents(),
            with_calibration: request.with_calibration,
            rng: env.tie_break_rng(),
        },
        outputs,
        application_log,
    )?;
    state.s_file_key = new_s_file_key;
    let _ = writeln!(
        application_log,
        "\nRuntime of invocation: {}s",
        start.elapsed().as_secs()
    );

    // The final period's analysis never wraps this past the range: the
    // state resets to await the next request below before it could matter,
    // even for a request ending at the maximum period.
    let advanced_period = given_period.wrapping_add(1);
    if what_to_do == Perform::FullAnalysis {
        old_s_files_to_delete.push(s_file_out_path);
        state.go_into_request_await();
    } else if let Phase::AwaitHFiles {
        next_expected_period,
        ..
    } = &mut state.phase
    {
        *next_expected_period = advanced_period;
    }

    Ok(())
}

fn find_periodic_key(inputs: &dyn TaskInputs, period: Period) -> Result<SymmetricKey> {
    let Some(entries) = inputs.topic(topics::PERIODIC_PSEUDONYMISATION_KEY) else {
        return Err(FootfallError::MissingTopic {
            name: topics::PERIODIC_PSEUDONYMISATION_KEY.to_owned(),
        });
    };
    for entry in entries {
        // The only producer is the trusted key issuer, so a malformed
        // entry is not an operator mistake.
        let entry = PeriodicKeyEntry::decode(entry)?;
        if entry.period == period {
            return Ok(SymmetricKey(entry.key));
        }
    }
    Err(FootfallError::MissingPeriodicKey { period })
}

fn process_cancel(
    env: &RuntimeEnv,
    state: &mut State,
    old_s_files_to_delete: &mut Vec<std::path::PathBuf>,
    application_log: &mut String,
) -> Result<()> {
    application_log.push_str("The report generation process was canceled manually.\n");
    if let Phase::AwaitHFiles { request, .. } = &state.phase {
        log_request_arguments(request, application_log);
    }

    old_s_files_to_delete.push(s_file_path(&env.data_dir, state.s_slot));
    old_s_files_to_delete.push(s_file_path(&env.data_dir, !state.s_slot));
    state.go_into_request_await();
    Ok(())
}

fn process_manual_finish(
    env: &RuntimeEnv,
    state: &mut State,
    outputs: &mut dyn TaskOutputs,
    old_s_files_to_delete: &mut Vec<std::path::PathBuf>,
    application_log: &mut String,
) -> Result<()> {
    let Phase::AwaitHFiles {
        request,
        next_expected_period,
    } = &state.phase
    else {
        return Err(FootfallError::internal("manual finish outside a request"));
    };
    let request = request.clone();
    let next_expected_period = *next_expected_period;

    application_log.push_str("The report generation process was started manually.\n");
    log_request_arguments(&request, application_log);
    let _ = writeln!(application_log, "Expected next period: {next_expected_period}");
    log_skipped_periods(
        u64::from(next_expected_period),
        u64::from(request.last_period) + 1,
        application_log,
    );

    // There are no pseudonyms to decrypt, so a zero key does.
    let pseudonymisation_key = SymmetricKey::zero();

    // An empty updates file keeps the pipeline uniform on this path.
    let dummy_h_path = env.data_dir.join(DUMMY_H_FILE_NAME);
    PlainFile::open(&dummy_h_path, OpenMode::WriteOnly)?.finish()?;

    let s_file_in_path = s_file_path(&env.data_dir, state.s_slot);
    let s_file_out_path = s_file_path(&env.data_dir, !state.s_slot);
    state.s_slot = !state.s_slot;
    old_s_files_to_delete.push(s_file_in_path.clone());

    EncryptedFile::create_empty_if_not_exists(&s_file_in_path, &state.s_file_key)?;

    let h_source = RecordSource::new(
        PlainFile::open(&dummy_h_path, OpenMode::ReadOnly)?,
        &dummy_h_path,
    )?;
    if !h_source.is_empty_file() {
        return Err(FootfallError::integrity(
            "data was found in the empty H dummy file",
        ));
    }
    let s_source = RecordSource::new(
        EncryptedFile::open(&s_file_in_path, OpenMode::ReadOnly, &state.s_file_key)?,
        &s_file_in_path,
    )?;
    if s_source.is_empty_file() {
        return Err(FootfallError::invalid_arguments(format!(
            "no data was found in the S file (if you want to cancel the processing, use the \
             <{}> argument)",
            arguments::CANCEL
        )));
    }

    let new_s_file_key = SymmetricKey::random();
    let start = Instant::now();
    analysis::run(
        AnalysisRun {
            h_source,
            s_source,
            s_out_path: s_file_out_path.clone(),
            s_out_key: new_s_file_key,
            pseudonymisation_key,
            what_to_do: Perform::FullAnalysis,
            reference_areas: request.build_reference_areas()?,
            census_residents: request.build_census_residents(),
            with_calibration: request.with_calibration,
            rng: env.tie_break_rng(),
        },
        outputs,
        application_log,
    )?;
    let _ = writeln!(
        application_log,
        "\nRuntime of invocation: {}s",
        start.elapsed().as_secs()
    );

    if let Err(error) = PlainFile::remove(&dummy_h_path) {
        warn!(%error, "could not remove the dummy H file");
    }

    old_s_files_to_delete.push(s_file_out_path);
    state.go_into_request_await();
    Ok(())
}
