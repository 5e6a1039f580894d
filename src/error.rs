//! Error types for contract-harvest
//!
//! The crate separates failures by how far they are allowed to travel:
//! - [`FetchError`] describes a single failed attempt. It never leaves the
//!   [`FetchExecutor`](crate::executor::FetchExecutor); exhausted targets become
//!   ledger entries instead.
//! - [`ExtractError`] and [`PartitionError`] cause one record (or one body) to be
//!   dropped and counted, never the page or the run.
//! - [`Error`] is everything that is propagated to a caller: configuration
//!   problems (fatal before any fetch), store and ledger I/O, shutdown.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for contract-harvest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for contract-harvest
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "listing.end_date")
        key: Option<String>,
    },

    /// I/O error outside of a specific store or ledger file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error outside of the retried fetch path (client construction)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV encoding or decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Writing to or reading from a tabular sheet failed
    ///
    /// Fatal for that physical target only; the caller decides whether to retry
    /// the whole page later.
    #[error("store error at {path}: {source}")]
    Store {
        /// The sheet file that could not be written
        path: PathBuf,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// Failure ledger could not be written or read
    #[error("failure ledger error at {path}: {source}")]
    Ledger {
        /// The ledger file
        path: PathBuf,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
    },

    /// No proxy/identity could be obtained within the identity retry budget
    #[error("identity source exhausted: {0}")]
    Identity(String),

    /// Shutdown in progress - not starting new pages or targets
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Whether this error happened before any fetch could start
    ///
    /// The binary maps these to a distinct exit code from a degraded run.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Error::Config { .. })
    }
}

/// Failure of a single fetch attempt
///
/// Every variant counts against the target's attempt budget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The remote answered with a non-success status
    #[error("HTTP status {0}")]
    Status(u16),

    /// The attempt exceeded its per-attempt timeout
    #[error("attempt timed out")]
    Timeout,

    /// Connection could not be established or was reset
    #[error("connection error: {0}")]
    Connection(String),

    /// A 2xx response whose body could not be read or was unusable
    #[error("malformed body: {0}")]
    MalformedBody(String),

    /// The identity source failed for this attempt
    #[error("identity unavailable: {0}")]
    Identity(String),
}

impl FetchError {
    /// Status code, when the failure came from an HTTP response
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Status(code) => Some(*code),
            _ => None,
        }
    }

    /// Short machine-readable label used in logs and ledger reasons
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Status(_) => "status",
            FetchError::Timeout => "timeout",
            FetchError::Connection(_) => "connection",
            FetchError::MalformedBody(_) => "malformed_body",
            FetchError::Identity(_) => "identity",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else if e.is_decode() || e.is_body() {
            FetchError::MalformedBody(e.to_string())
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

/// A successfully fetched body could not be turned into records
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    /// Body was not valid for the expected format (JSON, HTML)
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A required field was absent
    #[error("missing field: {0}")]
    MissingField(String),
}

impl ExtractError {
    /// Drop-reason label used in run summaries
    pub fn reason(&self) -> &'static str {
        match self {
            ExtractError::InvalidPayload(_) => "invalid_payload",
            ExtractError::MissingField(_) => "missing_field",
        }
    }
}

/// A record could not be routed to a partition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// The record does not carry the date field used for partitioning
    #[error("record has no '{field}' field")]
    MissingField {
        /// Name of the missing date field
        field: String,
    },

    /// The date field is present but not a calendar date
    #[error("unparsable date '{value}' in field '{field}'")]
    Unparsable {
        /// Name of the date field
        field: String,
        /// The raw value
        value: String,
    },

    /// The date lies outside the configured half-open range
    #[error("date {date} outside [{start}, {end})")]
    OutOfRange {
        /// The record's date
        date: chrono::NaiveDate,
        /// Inclusive start of the range
        start: chrono::NaiveDate,
        /// Exclusive end of the range
        end: chrono::NaiveDate,
    },
}

impl PartitionError {
    /// Drop-reason label used in run summaries
    pub fn reason(&self) -> &'static str {
        match self {
            PartitionError::MissingField { .. } => "missing_date",
            PartitionError::Unparsable { .. } => "unparsable_date",
            PartitionError::OutOfRange { .. } => "out_of_range",
        }
    }
}
