//! Centralized error types for newspool.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the newspool library.
#[derive(Error, Debug)]
pub enum NewsError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The active file is missing. The system cannot function without it.
    #[error("no active file at {0}")]
    ActiveMissing(PathBuf),

    /// A line of the active file failed to parse. A partially loaded
    /// index is worse than no index, so callers treat this as fatal.
    #[error("active file is corrupt at line {line}: {reason}")]
    ActiveCorrupt { line: u64, reason: String },

    /// A single unparsable history record. Sweeping callers skip these.
    #[error("garbled history record at line {line}")]
    Garbled { line: u64 },

    /// An article number outside the group's current bounds.
    #[error("article {article} outside active range {min}..={max}")]
    OutOfRange { article: u64, min: u64, max: u64 },

    /// A group name that has no record in the active table.
    #[error("no such newsgroup: {0}")]
    UnknownGroup(String),

    /// A malformed or out-of-order read-range list.
    #[error("bad range list: {reason}")]
    BadRangeList { reason: String },

    /// An article that could not be fetched or parsed.
    #[error("cannot fetch article {place}: {reason}")]
    Fetch { place: String, reason: String },
}

/// Convenience alias for `Result<T, NewsError>`.
pub type Result<T> = std::result::Result<T, NewsError>;

impl NewsError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is per-record (skippable) rather than structural.
    pub fn is_garbled(&self) -> bool {
        matches!(self, Self::Garbled { .. })
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `NewsError`
/// when no path context is available (rare; prefer `NewsError::io`).
impl From<std::io::Error> for NewsError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
