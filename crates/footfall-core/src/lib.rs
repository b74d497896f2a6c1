//! The trusted analytics core of the footfall mobility-statistics
//! pipeline.
//!
//! A statistical institute uploads a report request naming a period range,
//! reference areas and census counts; network operators supply one
//! pseudonymised footprint-update file per period. Each invocation of
//! [`run_invocation`] advances a persistent two-phase state machine:
//! waiting for a request, or accumulating update files into an encrypted
//! per-user state until the terminal period triggers the full analysis and
//! the three disclosure-controlled reports.
//!
//! The host only sees sealed state, encrypted state files, topic payloads
//! and the application log; stable user identifiers never leave the core.

pub mod aggregate;
pub mod analysis;
pub mod host;
pub mod invocation;
pub mod state;

pub use analysis::Perform;
pub use host::{MemoryTaskInputs, MemoryTaskOutputs, RuntimeEnv, TaskInputs, TaskOutputs};
pub use invocation::run_invocation;
pub use state::{Phase, State};
