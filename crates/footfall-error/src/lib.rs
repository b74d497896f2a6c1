use std::path::PathBuf;

use thiserror::Error;

/// Prefix attached to request-validation failures that are surfaced to the
/// host, so it can separate operator mistakes from integrity problems.
pub const USER_ERROR_PREFIX: &str = ":AE01: ";

/// Primary error type for the footfall analytics core.
///
/// Structured variants for the cases callers dispatch on; free-form detail
/// strings where only a diagnostic is needed.
#[derive(Error, Debug)]
pub enum FootfallError {
    // === Request validation (host/operator fixable) ===
    /// Arguments of an invocation do not match any accepted combination.
    #[error("invalid arguments: {detail}")]
    InvalidArguments { detail: String },

    /// A supplied period is outside the range the state machine expects.
    #[error("the received period ({given}) is not within the range of expected periods ( [{lo} - {hi}] )")]
    PeriodOutOfRange { given: u32, lo: u32, hi: u32 },

    /// A report request failed validation.
    #[error("invalid report request: {detail}")]
    BadReportRequest { detail: String },

    /// No pseudonymisation key was published for the requested period.
    #[error("could not find pseudonymisation key for requested period <{period}>")]
    MissingPeriodicKey { period: u32 },

    /// A required input topic is absent.
    #[error("input <{name}> not found")]
    MissingTopic { name: String },

    /// An input file required by the invocation is missing or unreadable.
    #[error("unable to open input file '{path}': {detail}")]
    BadInputFile { path: PathBuf, detail: String },

    // === Integrity (aborts the invocation, prior state preserved) ===
    /// Authenticated decryption failed, or sealed/derived data does not
    /// match its expected shape.
    #[error("integrity failure: {detail}")]
    Integrity { detail: String },

    /// HMAC verification of a decrypted pseudonym failed.
    #[error("HMAC check failed when reversing pseudonymisation")]
    PseudonymCheckFailed,

    /// A record file's size is not a multiple of the record size.
    #[error("file '{path}' size {size} is not a multiple of the record size {record_size}")]
    MisalignedRecordFile {
        path: PathBuf,
        size: u64,
        record_size: usize,
    },

    /// Fewer bytes than requested were available.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    // === I/O ===
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Host/operator fixable; surfaced with [`USER_ERROR_PREFIX`].
    InvalidRequest,
    /// Evidence of corruption or tampering; invocation aborts, persisted
    /// state is left untouched.
    Integrity,
    /// Environment trouble (plain I/O).
    Io,
    /// A bug.
    Internal,
}

impl FootfallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArguments { .. }
            | Self::PeriodOutOfRange { .. }
            | Self::BadReportRequest { .. }
            | Self::MissingPeriodicKey { .. }
            | Self::MissingTopic { .. }
            | Self::BadInputFile { .. } => ErrorKind::InvalidRequest,
            Self::Integrity { .. }
            | Self::PseudonymCheckFailed
            | Self::MisalignedRecordFile { .. }
            | Self::ShortRead { .. } => ErrorKind::Integrity,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The message as it is handed back to the host. Request-validation
    /// failures carry the machine-filterable prefix; everything else is
    /// passed through verbatim.
    pub fn user_facing_message(&self) -> String {
        match self.kind() {
            ErrorKind::InvalidRequest => format!("{USER_ERROR_PREFIX}{self}"),
            _ => self.to_string(),
        }
    }

    /// Create an invalid-arguments error.
    pub fn invalid_arguments(detail: impl Into<String>) -> Self {
        Self::InvalidArguments {
            detail: detail.into(),
        }
    }

    /// Create a report-request validation error.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadReportRequest {
            detail: detail.into(),
        }
    }

    /// Create an integrity error.
    pub fn integrity(detail: impl Into<String>) -> Self {
        Self::Integrity {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `FootfallError`.
pub type Result<T> = std::result::Result<T, FootfallError>;
