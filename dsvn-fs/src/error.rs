//! Error types for the revision store

use crate::checksum::Checksum;
use std::fmt::Display;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, FsError>;

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// On-disk format and requested configuration disagree, or the format is unknown
    #[error("Format mismatch: {0}")]
    FormatMismatch(String),

    /// Stored data does not match its recorded checksum, or could not be decoded
    #[error("Checksum mismatch in {context}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// The shard still has uncommitted member revisions
    #[error("Shard {shard} is incomplete (youngest revision is r{youngest})")]
    IncompleteShard { shard: u64, youngest: u64 },

    #[error("No such revision: r{0}")]
    NoSuchRevision(u64),

    #[error("Path not found in r{rev}: {path}")]
    PathNotFound { rev: u64, path: String },

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    /// A path the transaction touched changed in a revision committed meanwhile
    #[error("Conflict at {0:?}: changed since the transaction began")]
    Conflict(String),

    /// Structurally malformed header, manifest or trailer
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Packing ran past its deadline; the shard stays loose
    #[error("Packing of shard {shard} aborted: deadline exceeded")]
    PackAborted { shard: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A blocking store task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    pub(crate) fn checksum_mismatch(
        context: impl Into<String>,
        expected: &Checksum,
        actual: &Checksum,
    ) -> Self {
        FsError::ChecksumMismatch {
            context: context.into(),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        }
    }

    /// Content that cannot be decompressed or un-deltified never yields bytes.
    pub(crate) fn undecodable(
        context: impl Into<String>,
        expected: &Checksum,
        reason: impl Display,
    ) -> Self {
        FsError::ChecksumMismatch {
            context: context.into(),
            expected: expected.to_hex(),
            actual: format!("undecodable ({})", reason),
        }
    }

    /// True when a file that was expected to exist is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<bincode::Error> for FsError {
    fn from(e: bincode::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FsError {
    fn from(e: serde_json::Error) -> Self {
        FsError::Serialization(e.to_string())
    }
}
