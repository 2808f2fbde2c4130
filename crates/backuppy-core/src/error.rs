use std::path::PathBuf;

use thiserror::Error;

/// Every failure mode the core can produce, distinguishable by variant so
/// callers can match on policy (retry, skip, abort) rather than string-sniff.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup data is corrupted: {0}")]
    BackupCorrupted(String),

    #[error("could not parse diff stream: {0}")]
    DiffParseError(String),

    #[error("file changed while being read: {path}")]
    FileChanged { path: PathBuf },

    #[error("manifest is locked; call unlock() first")]
    ManifestLocked,

    #[error("I/O handle for {path:?} was opened twice")]
    DoubleBuffer { path: Option<PathBuf> },

    #[error("could not parse input: {0}")]
    InputParseError(String),

    #[error("unknown backend protocol: {0}")]
    UnknownProtocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
