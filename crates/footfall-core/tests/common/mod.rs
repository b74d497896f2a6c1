//! Shared fixture for driving whole invocations against a temporary data
//! directory.
#![allow(dead_code)] // each integration-test binary uses a subset

use std::collections::BTreeMap;
use std::path::PathBuf;

use tempfile::TempDir;

use footfall_core::{
    run_invocation, MemoryTaskInputs, MemoryTaskOutputs, RuntimeEnv, State,
};
use footfall_crypto::{encrypt_pseudonym, SymmetricKey};
use footfall_error::Result;
use footfall_store::SealedStore;
use footfall_types::params::{arguments, topics};
use footfall_types::request::ReferenceAreaEntry;
use footfall_types::{
    FixedRecord, Period, PeriodicKeyEntry, PseudonymisedFootprint, ReportRequest, TileIndex,
};

pub struct Fixture {
    dir: TempDir,
    pub env: RuntimeEnv,
    nsi_entries: Vec<Vec<u8>>,
    periodic_keys: BTreeMap<Period, SymmetricKey>,
}

/// A user's observation in one period: (user tag, tile, values).
pub type Observation = (u8, (u16, u16), [f32; 4]);

pub fn user_id(tag: u8) -> [u8; 12] {
    [tag; 12]
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut env = RuntimeEnv::new(dir.path().to_path_buf(), SymmetricKey::random());
        env.rng_seed = Some([7; 32]);
        Self {
            dir,
            env,
            nsi_entries: Vec::new(),
            periodic_keys: BTreeMap::new(),
        }
    }

    /// Queue a well-formed report request on the request topic.
    pub fn push_request(&mut self, request: &ReportRequest) {
        self.nsi_entries.push(request.encode());
    }

    /// Queue raw bytes on the request topic (malformed entries).
    pub fn push_raw_request(&mut self, entry: Vec<u8>) {
        self.nsi_entries.push(entry);
    }

    /// Publish a periodic pseudonymisation key and return it.
    pub fn issue_periodic_key(&mut self, period: Period) -> SymmetricKey {
        let mut key = [0u8; 16];
        key[0] = period as u8;
        key[1] = (period >> 8) as u8;
        key[15] = 0x5A;
        let key = SymmetricKey(key);
        self.periodic_keys.insert(period, key);
        key
    }

    /// Write an update file (plus its metadata sidecar) whose pseudonyms
    /// are valid for `period`.
    pub fn write_h_file(&self, name: &str, period: Period, observations: &[Observation]) -> PathBuf {
        let key = self
            .periodic_keys
            .get(&period)
            .expect("periodic key issued for the period");
        let mut data = Vec::new();
        for (tag, (easting, northing), values) in observations {
            let record = PseudonymisedFootprint {
                pseudonym: encrypt_pseudonym(key, &user_id(*tag)),
                tile: TileIndex::new(*easting, *northing),
                values: *values,
            };
            let mut buf = vec![0u8; PseudonymisedFootprint::ENCODED_LEN];
            record.encode_into(&mut buf);
            data.extend_from_slice(&buf);
        }
        let path = self.dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        std::fs::write(
            self.dir.path().join(format!("{name}.meta")),
            format!("test upload for period {period}\n"),
        )
        .unwrap();
        path
    }

    fn inputs(&self, args: &[(&str, &str)]) -> MemoryTaskInputs {
        let mut inputs = MemoryTaskInputs::new();
        for entry in &self.nsi_entries {
            inputs.push_topic_entry(topics::NSI_INPUT, entry.clone());
        }
        for (period, key) in &self.periodic_keys {
            inputs.push_topic_entry(
                topics::PERIODIC_PSEUDONYMISATION_KEY,
                PeriodicKeyEntry {
                    period: *period,
                    key: key.0,
                }
                .encode(),
            );
        }
        for (name, value) in args {
            inputs.set_argument(name, value);
        }
        inputs
    }

    /// One invocation with the given arguments.
    pub fn invoke(&self, args: &[(&str, &str)]) -> Result<MemoryTaskOutputs> {
        let inputs = self.inputs(args);
        let mut outputs = MemoryTaskOutputs::new();
        run_invocation(&self.env, &inputs, &mut outputs)?;
        Ok(outputs)
    }

    /// Invoke with no arguments (request digestion).
    pub fn digest(&self) -> MemoryTaskOutputs {
        self.invoke(&[]).expect("digestion succeeds")
    }

    /// Invoke with `{file, period}`.
    pub fn process(&self, h_file: &std::path::Path, period: Period) -> Result<MemoryTaskOutputs> {
        self.invoke(&[
            (arguments::FILE, h_file.to_str().unwrap()),
            (arguments::PERIOD, &period.to_string()),
        ])
    }

    /// The persisted state, read back through the sealed store.
    pub fn state(&self) -> State {
        let store = SealedStore::new(self.dir.path().join("state_file"), &self.env.sealing_key);
        State::load(&store).expect("state loads")
    }

    pub fn data_path(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn s_file_exists(&self, slot: bool) -> bool {
        self.dir
            .path()
            .join(if slot { "s_file1" } else { "s_file0" })
            .exists()
    }
}

/// Build a request over inclusive periods with one-tile shorthand tables.
pub fn request(
    first_period: Period,
    last_period: Period,
    with_calibration: bool,
    areas: &[(u8, (u16, u16))],
    census: &[((u16, u16), f64)],
) -> ReportRequest {
    ReportRequest {
        first_period,
        last_period,
        with_calibration,
        reference_areas: areas
            .iter()
            .map(|(id, (easting, northing))| ReferenceAreaEntry {
                id: *id,
                tile: TileIndex::new(*easting, *northing),
            })
            .collect(),
        census_residents: census
            .iter()
            .map(|((easting, northing), value)| (TileIndex::new(*easting, *northing), *value))
            .collect(),
    }
}

pub fn application_log(outputs: &MemoryTaskOutputs) -> String {
    String::from_utf8(outputs.single(topics::APPLICATION_LOG).to_vec()).unwrap()
}
