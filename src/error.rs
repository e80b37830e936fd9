use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by loading, caching and exporting.
///
/// Aggregation never produces these; it reports empty selections through
/// [`crate::aggregate::AggregateError`] values instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("malformed matrix in {path}: {reason}")]
    MalformedMatrix { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("file not registered in cache: {0}")]
    NotRegistered(PathBuf),

    #[error("analysis {0} not found")]
    UnknownAnalysis(String),

    #[error("cache schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedMatrix {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
