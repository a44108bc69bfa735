//! Error types for the library layer.
//!
//! Everything returned as `Err` here is fatal to the operation that produced
//! it. Items that were merely skipped (a file that could not be read, a
//! malformed log line) are reported through the summaries instead.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure decoding or encoding a single log record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record has no digest")]
    MissingDigest,

    #[error("legacy line has too few fields: {0:?}")]
    LegacyFields(String),
}

/// External sort failure. The sort input is left untouched.
#[derive(Debug, Error)]
pub enum SortError {
    #[error("sort I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("a merge worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("job cache I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("job cache path {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("record log is not open")]
    Closed,

    #[error("corrupt record at offset {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: RecordError,
    },

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Sort(#[from] SortError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a hashing worker panicked")]
    WorkerPanicked,
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("directory {0} does not exist or is not a directory")]
    MissingDirectory(PathBuf),

    #[error("cannot resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Exclusion filter construction failure.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("cannot read ignore file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Glob(#[from] globset::Error),
}
