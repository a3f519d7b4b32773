//! Error types for shardsync operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during shardsync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// I/O error during read/write operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The profile document could not be parsed.
    #[error("Profile parse error: {0}")]
    ProfileParse(String),

    /// A shard entry in the profile is missing its size.
    #[error("Shard size is missing in profile for {path}")]
    MissingSize {
        /// Path of the shard with no recorded size
        path: String,
    },

    /// A digest window extends past the end of the file.
    #[error("Digest window out of bounds: skip {skip} + size {size} exceeds file size {file_size}")]
    RangeOutOfBounds {
        /// Bytes skipped from the start of the file
        skip: u64,
        /// Requested window size
        size: u64,
        /// Actual file size
        file_size: u64,
    },

    /// Mount configuration line rejected.
    #[error("Invalid mount config at line {line}: {reason}")]
    MountConfig {
        /// 1-based line number in the JSONL stream
        line: usize,
        /// Why the line was rejected
        reason: String,
    },

    /// The mount worker task ended abnormally (panic or forced shutdown).
    #[error("Mount task failed: {0}")]
    MountTask(String),

    /// Source digest did not match before an overwrite copy.
    #[error("Digest precheck failed: expected {expected}, got {actual}")]
    DigestPrecheck {
        /// Digest the plan promised
        expected: String,
        /// Digest computed over the staged file
        actual: String,
    },

    /// Destination digest did not match after an append copy.
    #[error("Digest postcheck failed: expected {expected}, got {actual}")]
    DigestPostcheck {
        /// Digest the plan promised
        expected: String,
        /// Digest computed over the final file
        actual: String,
    },

    /// Destination file size did not match before an append copy.
    #[error("Destination size precheck failed: expected {expected}, got {actual}")]
    DestSizePrecheck {
        /// Size the append task expects to find
        expected: i64,
        /// Size actually on disk
        actual: i64,
    },

    /// The staged source file does not exist.
    #[error("Source file missing: {0}")]
    SourceMissing(PathBuf),

    /// The staged source file is not a regular file.
    #[error("Not a regular file: {0}")]
    NotARegularFile(PathBuf),

    /// The task store rejected an operation or is unreachable.
    #[error("Task store error: {0}")]
    TaskStore(String),

    /// The object store rejected an operation or is unreachable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The run was cancelled by a shutdown signal.
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProfileParse(err.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(err: rusqlite::Error) -> Self {
        Self::TaskStore(err.to_string())
    }
}

/// Result type for shardsync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
